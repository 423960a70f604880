use {
    crate::{
        dbus::{
            Immediate, NameWatchEvent,
            bus::{ALLOW_REPLACEMENT, REMOVE_MATCH, REPLACE_EXISTING},
        },
        it::{test_error::TestResult, test_expected_event::TestExpectedEvent, testrun::TestRun},
    },
    std::sync::Arc,
};

testcase!();

const NAME: &str = "org.example.Handover";

fn test(run: Arc<TestRun>) -> TestResult {
    let conn = run.connect()?;
    let old = run.connect()?;
    let new = run.connect()?;
    let old_name = run.unique_name(&old)?;
    let new_name = run.unique_name(&new)?;
    let first = TestExpectedEvent::<NameWatchEvent>::new();
    let second = TestExpectedEvent::<NameWatchEvent>::new();

    let _old_owner = old.own_name(NAME, ALLOW_REPLACEMENT, Arc::new(Immediate), |_| ())?;
    run.sync(&old)?;
    let watcher = conn.watch_name(NAME, Arc::new(Immediate), first.pusher())?;
    tassert_eq!(first.next()?, NameWatchEvent::Appeared(old_name));

    let _new_owner = new.own_name(NAME, REPLACE_EXISTING, Arc::new(Immediate), |_| ())?;
    tassert_eq!(first.next()?, NameWatchEvent::Vanished);
    tassert_eq!(first.next()?, NameWatchEvent::Appeared(new_name.clone()));

    // A second watcher shares the record and starts from its state.
    let joined = conn.watch_name(NAME, Arc::new(Immediate), second.pusher())?;
    tassert_eq!(second.next()?, NameWatchEvent::Appeared(new_name.clone()));
    tassert_eq!(joined.owner(), Some(new_name));
    tassert_eq!(conn.subscription_count(), 1);

    watcher.unwatch();
    tassert_eq!(first.next()?, NameWatchEvent::Vanished);
    run.sync(&conn)?;
    tassert_eq!(run.bus.received(REMOVE_MATCH), 0);
    second.none()?;

    drop(joined);
    tassert_eq!(second.next()?, NameWatchEvent::Vanished);
    tassert!(run.bus.wait_received(REMOVE_MATCH, 1));
    run.sync(&conn)?;
    first.none()?;
    second.none()?;
    tassert_eq!(conn.subscription_count(), 0);
    Ok(())
}
