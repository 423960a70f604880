use {
    crate::{
        dbus::{
            CallError, DbusError, DynamicType, Immediate, MatchRule, Method, MethodInvocation,
            Reply, Signal, Value, WorkerThread,
        },
        it::{
            test_error::{TestErrorExt, TestResult},
            test_expected_event::TestExpectedEvent,
            testrun::TestRun,
        },
    },
    std::sync::Arc,
};

testcase!();

const PATH: &str = "/org/example/Store";
const IFACE: &str = "org.example.Store";

fn test(run: Arc<TestRun>) -> TestResult {
    let server = run.connect()?;
    let client = run.connect()?;
    let dest = run.unique_name(&server)?;
    let client_name = run.unique_name(&client)?;

    let worker = WorkerThread::new("store").with_context(|| "Could not spawn a worker")?;
    let invocations = TestExpectedEvent::<MethodInvocation>::new();
    let obj = {
        let invocations = invocations.clone();
        move |inv: &MethodInvocation| -> Result<Vec<Value>, CallError> {
            invocations.push(inv.clone());
            let keys = Value::string_array(["a", "b"]);
            Ok(vec![keys])
        }
    };
    server.export(PATH, IFACE, worker.clone(), Arc::new(obj))?;

    let list = Method::new(&dest, PATH, IFACE, "List");
    let replies = TestExpectedEvent::<Result<Reply, DbusError>>::new();
    let pusher = replies.pusher();
    client.call_with(&list, &[Value::from("prefix")], None, Arc::new(Immediate), pusher)?;
    let reply = replies.next()??;
    tassert_eq!(reply.signature.as_str(), "as");
    tassert_eq!(
        reply.body,
        vec![Value::array(
            DynamicType::String,
            vec![Value::from("a"), Value::from("b")]
        )]
    );
    let inv = invocations.next()?;
    tassert_eq!(inv.sender.as_deref(), Some(client_name.as_str()));
    tassert_eq!(inv.path.as_str(), PATH);
    tassert_eq!(inv.interface.as_str(), IFACE);
    tassert_eq!(inv.member.as_str(), "List");
    tassert_eq!(inv.args, vec![Value::from("prefix")]);
    tassert!(!inv.no_reply);

    client.call_noreply(&list, &[])?;
    let inv = invocations.next()?;
    tassert!(inv.no_reply);
    worker.wait_idle();
    run.sync(&server)?;
    run.sync(&client)?;
    replies.none()?;
    tassert_eq!(client.pending_calls(), 0);

    let signals = TestExpectedEvent::<Signal>::new();
    let rule = MatchRule::new().sender(&dest).interface(IFACE).member("Changed");
    let handler = {
        let signals = signals.clone();
        move |s: &Signal| signals.push(s.clone())
    };
    let id = client.subscribe(rule, Arc::new(Immediate), handler)?;
    run.sync(&client)?;
    server.emit_signal(PATH, IFACE, "Changed", &[Value::from("a")])?;
    server.emit_signal(PATH, IFACE, "Removed", &[Value::from("b")])?;
    let signal = signals.next()?;
    tassert_eq!(signal.sender.as_deref(), Some(dest.as_str()));
    tassert_eq!(signal.path.as_str(), PATH);
    tassert_eq!(signal.body, vec![Value::from("a")]);
    run.sync(&server)?;
    run.sync(&client)?;
    signals.none()?;

    tassert!(client.unsubscribe(id));
    tassert!(!client.unsubscribe(id));
    run.sync(&client)?;
    server.emit_signal(PATH, IFACE, "Changed", &[Value::from("c")])?;
    run.sync(&server)?;
    run.sync(&client)?;
    signals.none()?;
    Ok(())
}
