use {
    log::{Level, LevelFilter, Log, Metadata, Record},
    std::{
        fmt::Write as FmtWrite,
        io::{self, Write},
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::SystemTime,
    },
};

static LEVEL: AtomicUsize = AtomicUsize::new(Level::Info as usize);

pub fn install() {
    let _ = log::set_logger(&Logger);
    log::set_max_level(LevelFilter::Info);
}

pub fn set_level(level: Level) {
    LEVEL.store(level as usize, Ordering::Relaxed);
    log::set_max_level(level.to_level_filter());
}

struct Logger;

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() as usize <= LEVEL.load(Ordering::Relaxed)
    }

    fn log(&self, record: &Record) {
        if record.level() as usize > LEVEL.load(Ordering::Relaxed) {
            return;
        }
        let mut buf = String::new();
        let now = SystemTime::now();
        let thread = thread::current();
        let thread = thread.name().unwrap_or("?");
        let _ = if let Some(mp) = record.module_path() {
            writeln!(
                buf,
                "[{} {:5} {} {}] {}",
                humantime::format_rfc3339_millis(now),
                record.level(),
                thread,
                mp,
                record.args(),
            )
        } else {
            writeln!(
                buf,
                "[{} {:5} {}] {}",
                humantime::format_rfc3339_millis(now),
                record.level(),
                thread,
                record.args(),
            )
        };
        let _ = io::stderr().lock().write_all(buf.as_bytes());
    }

    fn flush(&self) {
        // nothing
    }
}
