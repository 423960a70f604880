use {
    crate::{
        dbus::{
            Immediate, MatchRule, Signal, Value,
            bus::{ADD_MATCH, REMOVE_MATCH},
        },
        it::{test_error::TestResult, test_expected_event::TestExpectedEvent, testrun::TestRun},
    },
    std::sync::Arc,
};

testcase!();

const PATH: &str = "/org/example/Sensor";
const IFACE: &str = "org.example.Sensor";

fn test(run: Arc<TestRun>) -> TestResult {
    let conn = run.connect()?;
    let emitter = run.connect()?;
    let unique = run.unique_name(&conn)?;
    let rule = MatchRule::new().interface(IFACE).member("Reading").path(PATH);

    let first = TestExpectedEvent::<Value>::new();
    let second = TestExpectedEvent::<Value>::new();
    let handler = |events: &TestExpectedEvent<Value>| {
        let events = events.clone();
        move |s: &Signal| events.push(s.body[0].clone())
    };
    let a = conn.subscribe(rule.clone(), Arc::new(Immediate), handler(&first))?;
    let b = conn.subscribe(rule.clone(), Arc::new(Immediate), handler(&second))?;
    run.sync(&conn)?;
    tassert_eq!(run.bus.received(ADD_MATCH), 1);
    tassert_eq!(run.bus.rules(&unique), 1);
    tassert_eq!(conn.registrations(&rule), 2);
    let add = run
        .bus
        .calls()
        .into_iter()
        .find(|c| c.member == ADD_MATCH)
        .map(|c| c.args);
    tassert_eq!(add, Some(vec![Value::String(rule.to_string())]));

    emitter.emit_signal(PATH, IFACE, "Reading", &[Value::U32(1)])?;
    emitter.emit_signal("/org/example/Other", IFACE, "Reading", &[Value::U32(2)])?;
    tassert_eq!(first.next()?, Value::U32(1));
    tassert_eq!(second.next()?, Value::U32(1));

    tassert!(conn.unsubscribe(a));
    run.sync(&conn)?;
    tassert_eq!(run.bus.received(REMOVE_MATCH), 0);
    tassert_eq!(run.bus.rules(&unique), 1);

    emitter.emit_signal(PATH, IFACE, "Reading", &[Value::U32(3)])?;
    tassert_eq!(second.next()?, Value::U32(3));
    run.sync(&emitter)?;
    run.sync(&conn)?;
    first.none()?;
    second.none()?;

    tassert!(conn.unsubscribe(b));
    run.sync(&conn)?;
    tassert_eq!(run.bus.received(REMOVE_MATCH), 1);
    tassert_eq!(run.bus.rules(&unique), 0);
    tassert_eq!(conn.registrations(&rule), 0);
    tassert_eq!(conn.subscription_count(), 0);

    let c = conn.subscribe(rule.clone(), Arc::new(Immediate), handler(&first))?;
    run.sync(&conn)?;
    tassert_eq!(run.bus.received(ADD_MATCH), 2);
    emitter.emit_signal(PATH, IFACE, "Reading", &[Value::U32(4)])?;
    tassert_eq!(first.next()?, Value::U32(4));
    tassert!(conn.unsubscribe(c));
    Ok(())
}
