use {
    crate::dbus::{
        ExecutionContext, Immediate, LocalQueue, WorkerThread,
        context::Mailbox,
    },
    parking_lot::Mutex,
    std::{
        sync::Arc,
        thread::{self, ThreadId},
    },
};

#[test]
fn worker_thread_fifo() {
    let worker = WorkerThread::new("test worker").unwrap();
    let seen = Arc::new(Mutex::new(vec![]));
    let threads = Arc::new(Mutex::new(vec![]));
    for i in 0..100 {
        let seen = seen.clone();
        let threads = threads.clone();
        worker.schedule(Box::new(move || {
            seen.lock().push(i);
            threads.lock().push(thread::current().id());
        }));
    }
    worker.wait_idle();
    assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    let threads = threads.lock();
    assert!(threads.iter().all(|t| *t == threads[0]));
    assert_ne!(threads[0], thread::current().id());
}

#[test]
fn local_queue() {
    let queue = LocalQueue::new();
    let seen = Arc::new(Mutex::new(vec![]));
    for i in 0..3 {
        let seen = seen.clone();
        let q = queue.clone();
        queue.schedule(Box::new(move || {
            seen.lock().push(i);
            let seen = seen.clone();
            q.schedule(Box::new(move || seen.lock().push(i + 10)));
        }));
    }
    assert_eq!(queue.len(), 3);
    assert!(seen.lock().is_empty());
    assert_eq!(queue.run_pending(), 6);
    assert_eq!(*seen.lock(), [0, 1, 2, 10, 11, 12]);
    assert_eq!(queue.run_pending(), 0);
}

#[test]
fn mailbox_reentrant_delivery() {
    let seen = Arc::new(Mutex::new(vec![]));
    let mailbox: Arc<Mutex<Option<Arc<Mailbox<u32>>>>> = Default::default();
    let handler = {
        let seen = seen.clone();
        let mailbox = mailbox.clone();
        Arc::new(move |n: u32| {
            seen.lock().push(n);
            if n == 1 {
                let mb = mailbox.lock().clone();
                if let Some(mb) = mb {
                    mb.push(3);
                    mb.flush();
                    seen.lock().push(100);
                }
            }
        })
    };
    let mb = Mailbox::new(Arc::new(Immediate), handler);
    *mailbox.lock() = Some(mb.clone());
    mb.push(1);
    mb.push(2);
    mb.flush();
    assert_eq!(*seen.lock(), [1, 100, 2, 3]);
    *mailbox.lock() = None;
}

#[test]
fn mailbox_on_worker() {
    let worker = WorkerThread::new("mailbox worker").unwrap();
    let seen: Arc<Mutex<Vec<(u32, ThreadId)>>> = Default::default();
    let mb = Mailbox::new(worker.clone(), {
        let seen = seen.clone();
        Arc::new(move |n: u32| seen.lock().push((n, thread::current().id())))
    });
    for i in 0..10 {
        mb.push(i);
        if i % 3 == 0 {
            mb.flush();
        }
    }
    mb.flush();
    worker.wait_idle();
    let seen = seen.lock();
    assert_eq!(
        seen.iter().map(|s| s.0).collect::<Vec<_>>(),
        (0..10).collect::<Vec<_>>()
    );
    assert!(seen.iter().all(|s| s.1 != thread::current().id()));
}
