use {
    crate::{
        dbus::{
            Immediate, NameOwnerEvent, RequestNameFlags,
            bus::{RELEASE_NAME, REQUEST_NAME},
        },
        it::{test_error::TestResult, test_expected_event::TestExpectedEvent, testrun::TestRun},
    },
    std::sync::Arc,
};

testcase!();

const NAME: &str = "org.example.Free";

fn test(run: Arc<TestRun>) -> TestResult {
    let conn = run.connect()?;
    let unique = run.unique_name(&conn)?;
    let events = TestExpectedEvent::<NameOwnerEvent>::new();
    let flags = RequestNameFlags::none();
    let owner = conn.own_name(NAME, flags, Arc::new(Immediate), events.pusher())?;
    tassert_eq!(owner.name(), NAME);
    tassert_eq!(events.next()?, NameOwnerEvent::Acquired);
    run.sync(&conn)?;
    events.none()?;
    tassert!(owner.is_owner());
    tassert_eq!(run.bus.owner(NAME), Some(unique));
    tassert_eq!(run.bus.received(REQUEST_NAME), 1);
    tassert_eq!(conn.get_name_owner(NAME)?, conn.unique_name().map(|n| n.to_string()));

    match conn.own_name(":1.99", RequestNameFlags::none(), Arc::new(Immediate), |_| ()) {
        Err(_) => {}
        Ok(_) => bail!("A unique name was accepted as a well-known name"),
    }

    owner.release();
    tassert_eq!(events.next()?, NameOwnerEvent::Lost);
    tassert_eq!(run.bus.received(RELEASE_NAME), 1);
    tassert_eq!(run.bus.owner(NAME), None);
    run.sync(&conn)?;
    events.none()?;
    tassert_eq!(conn.subscription_count(), 0);
    Ok(())
}
