#[path = "driver_support.rs"]
mod support;

use std::time::{Duration, Instant};

use reactive_tck_driver::{Command, Dispatcher, DriverError, DriverResult, Payload, Verdict};
use support::{single_test, LoopbackFactory, Options};

fn run(factory: &LoopbackFactory, script: &str) -> DriverResult<Verdict> {
    let test = single_test(script);
    Dispatcher::new(test.name(), factory.shared()).run(test.commands())
}

#[test]
fn request_response_completes_and_passes() {
    let factory = LoopbackFactory::new();
    let verdict = run(
        &factory,
        "!\nname%%rr\nsubscribe%%rr%%x%%d%%m\nrequest%%1%%x\nawait%%terminal%%x\nassert%%completed%%x\nassert%%received%%x%%d,m\n",
    )
    .unwrap();
    assert_eq!(verdict, Verdict::Pass);
    assert_eq!(factory.connections(), 1);
}

#[test]
fn failing_assertion_fails_the_test() {
    let factory = LoopbackFactory::new();
    let verdict = run(
        &factory,
        "!\nname%%rrError\nsubscribe%%rr%%x%%error%%m\nrequest%%1%%x\nawait%%terminal%%x\nassert%%completed%%x\n",
    )
    .unwrap();
    assert_eq!(verdict, Verdict::Fail);
}

#[test]
fn expected_failure_that_fails_passes() {
    let factory = LoopbackFactory::new();
    let verdict = run(
        &factory,
        "!\nname%%rrExpectedError\nfail\nsubscribe%%rr%%x%%error%%m\nrequest%%1%%x\nawait%%terminal%%x\nassert%%completed%%x\n",
    )
    .unwrap();
    assert_eq!(verdict, Verdict::Pass);
}

#[test]
fn expected_failure_that_passes_fails() {
    let factory = LoopbackFactory::new();
    let verdict = run(
        &factory,
        "!\nname%%unexpectedPass\nfail\nsubscribe%%rr%%x%%d%%m\nrequest%%1%%x\nawait%%terminal%%x\nassert%%completed%%x\n",
    )
    .unwrap();
    assert_eq!(verdict, Verdict::Fail);
}

#[test]
fn cancel_before_delivery_is_not_an_error() {
    let factory = LoopbackFactory::new();
    let verdict = run(
        &factory,
        "!\nname%%cancel\nsubscribe%%rs%%x%%d%%m\ncancel%%x\nassert%%canceled%%x\nassert%%no_error%%x\nassert%%received_n%%x%%0\nrequest%%2%%x\nassert%%received_n%%x%%0\n",
    )
    .unwrap();
    assert_eq!(verdict, Verdict::Pass);
}

#[test]
fn received_matches_exact_sequence_only() {
    let factory = LoopbackFactory::new();
    let exact = "!\nname%%exact\nsubscribe%%rs%%x%%a%%b\ntake%%3%%x\nawait%%terminal%%x\nassert%%received%%x%%a,b&&a,b&&a,b\n";
    assert_eq!(run(&factory, exact).unwrap(), Verdict::Pass);

    let missing = "!\nname%%missing\nsubscribe%%rs%%x%%a%%b\ntake%%3%%x\nassert%%received%%x%%a,b&&a,b\n";
    assert_eq!(run(&factory, missing).unwrap(), Verdict::Fail);

    let extra = "!\nname%%extra\nsubscribe%%rs%%x%%a%%b\ntake%%2%%x\nassert%%received%%x%%a,b&&a,b&&a,b\n";
    assert_eq!(run(&factory, extra).unwrap(), Verdict::Fail);

    let reordered = "!\nname%%reordered\nsubscribe%%rr%%x%%a%%b\nrequest%%1%%x\nawait%%terminal%%x\nassert%%received%%x%%b,a\n";
    assert_eq!(run(&factory, reordered).unwrap(), Verdict::Fail);
}

#[test]
fn no_events_window_ignores_later_delivery() {
    let factory = LoopbackFactory::with_options(Options {
        late_delay: Duration::from_millis(600),
        ..Options::default()
    });
    let start = Instant::now();
    let verdict = run(
        &factory,
        "!\nname%%quiet\nsubscribe%%rs%%x%%late%%m\nrequest%%1%%x\nawait%%no_events%%x%%500\nawait%%atLeast%%x%%1\nassert%%received_n%%x%%1\n",
    )
    .unwrap();
    assert_eq!(verdict, Verdict::Pass);
    assert!(start.elapsed() >= Duration::from_millis(600));
}

#[test]
fn subscription_streams_under_demand() {
    let factory = LoopbackFactory::new();
    let verdict = run(
        &factory,
        "!\nname%%subscription\nsubscribe%%sub%%x%%a%%b\ntake%%5%%x\nassert%%received_at_least%%x%%5\nassert%%no_completed%%x\ncancel%%x\nassert%%canceled%%x\n",
    )
    .unwrap();
    assert_eq!(verdict, Verdict::Pass);
}

#[test]
fn every_registered_consumer_counts() {
    let factory = LoopbackFactory::new();
    let verdict = run(
        &factory,
        "!\nname%%two\nsubscribe%%rr%%x%%d%%m\nsubscribe%%rr%%y%%error%%m\nrequest%%1%%x\nrequest%%1%%y\nawait%%terminal%%y\nassert%%error%%y\nassert%%completed%%x\n",
    )
    .unwrap();
    assert_eq!(verdict, Verdict::Pass);
    assert_eq!(factory.connections(), 2);
}

#[test]
fn unknown_ids_are_skipped() {
    let factory = LoopbackFactory::new();
    let verdict = run(
        &factory,
        "!\nname%%lookup\nsubscribe%%rr%%x%%d%%m\nrequest%%1%%nobody\nassert%%completed%%nobody\nassert%%no_completed%%x\n",
    )
    .unwrap();
    assert_eq!(verdict, Verdict::Pass);
}

#[test]
fn fire_and_forget_completes_and_eof_sends_shutdown() {
    let factory = LoopbackFactory::new();
    let verdict = run(
        &factory,
        "!\nname%%fnf\nsubscribe%%fnf%%f%%hello%%world\nassert%%completed%%f\nassert%%no_error%%f\nEOF\n",
    )
    .unwrap();
    assert_eq!(verdict, Verdict::Pass);
    assert_eq!(
        factory.fire_and_forget_payloads(),
        vec![Payload::new("hello", "world"), Payload::shutdown()]
    );
    assert_eq!(factory.shutdowns(), 1);
}

#[test]
fn value_assertion_on_fire_and_forget_fails() {
    let factory = LoopbackFactory::new();
    let verdict = run(
        &factory,
        "!\nname%%fnfValues\nsubscribe%%fnf%%f%%a%%b\nassert%%received%%f%%a,b\n",
    )
    .unwrap();
    assert_eq!(verdict, Verdict::Fail);
}

#[test]
fn test_without_interactions_is_an_error() {
    let factory = LoopbackFactory::new();
    let err = run(&factory, "!\nname%%empty\npass\n").unwrap_err();
    assert!(matches!(err, DriverError::NoInteraction(name) if name == "empty"));
}

#[test]
fn malformed_command_aborts_the_test() {
    let factory = LoopbackFactory::new();
    let err = run(&factory, "!\nname%%broken\nsubscribe%%rr%%x%%d%%m\nrequest%%lots%%x\n").unwrap_err();
    assert!(matches!(err, DriverError::MalformedCommand { .. }));
}

#[test]
fn refused_connection_propagates() {
    let factory = LoopbackFactory::with_options(Options {
        refuse_connections: true,
        ..Options::default()
    });
    let err = run(&factory, "!\nname%%offline\nsubscribe%%rr%%x%%d%%m\n").unwrap_err();
    assert!(matches!(err, DriverError::Connect { .. }));
}

#[test]
fn commands_can_be_executed_one_at_a_time() {
    let factory = LoopbackFactory::new();
    let mut dispatcher = Dispatcher::new("stepwise", factory.shared());
    dispatcher
        .execute(Command::Subscribe {
            kind: reactive_tck_driver::InteractionKind::RequestStream,
            id: "s".to_string(),
            payload: Payload::new("a", "b"),
        })
        .unwrap();
    dispatcher
        .execute(Command::Request {
            n: 3,
            id: "s".to_string(),
        })
        .unwrap();
    assert_eq!(dispatcher.verdict().unwrap(), Verdict::Pass);
}

#[test]
fn connections_stay_open_until_the_test_ends() {
    let factory = LoopbackFactory::new();
    let mut dispatcher = Dispatcher::new("lifetime", factory.shared());
    for command in single_test(
        "!\nname%%lifetime\nsubscribe%%sub%%x%%a%%b\nsubscribe%%rr%%y%%c%%d\nrequest%%1%%x\nEOF\n",
    )
    .commands()
    {
        dispatcher.execute(command).unwrap();
    }
    assert_eq!(factory.open_connections(), 3);

    drop(dispatcher);
    assert_eq!(factory.connections(), 3);
    assert_eq!(factory.open_connections(), 0);
}
