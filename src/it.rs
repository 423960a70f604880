use {
    crate::it::{test_bus::TestBus, testrun::TestRun, tests::TestCase},
    log::Level,
    std::sync::{Arc, Once},
};

#[macro_use]
mod test_error;
#[macro_use]
mod test_macros;
mod test_bus;
mod test_expected_event;
mod test_logger;
mod testrun;

fn install_logger() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        test_logger::install();
        test_logger::set_level(Level::Debug);
    });
}

fn run_test(test: &dyn TestCase) {
    install_logger();
    log::info!("Running {}", test.name());
    let testrun = Arc::new(TestRun {
        name: test.name(),
        bus: TestBus::new(),
    });
    let res = test.run(testrun.clone());
    testrun.bus.shutdown();
    if let Err(e) = res {
        log::error!("{} failed: {}", test.name(), e);
        panic!("{} failed: {}", test.name(), e);
    }
}
