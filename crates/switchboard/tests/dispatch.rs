//! Routing and ordering, observed through the testing harness.

use serde_json::{json, Value};
use switchboard_core::{event, Component, Context, Event, HandlerSet, Payload, ANY};
use switchboard_testing::Harness;

struct Ladder;

impl Component for Ladder {
    fn channel(&self) -> &str {
        "ladder"
    }

    fn handlers(set: &mut HandlerSet<Self>) {
        set.on("step", |_, _, _: Payload<'_>| "first");
        set.on("step", |_, _, _: Payload<'_>| "second");
        set.on("step", |_, _, _: Payload<'_>| false)
            .filter()
            .priority(5.0);
        set.on("step", |_, _, _: Payload<'_>| "below").priority(-1.0);
    }
}

struct RaisedLadder;

impl Component for RaisedLadder {
    fn channel(&self) -> &str {
        "ladder"
    }

    fn handlers(set: &mut HandlerSet<Self>) {
        set.on("step", |_, _, _: Payload<'_>| "zero");
        set.on("step", |_, _, _: Payload<'_>| "five").priority(5.0);
        set.on("step", |_, _, _: Payload<'_>| false)
            .filter()
            .priority(5.0);
        set.on("step", |_, _, _: Payload<'_>| "below").priority(-1.0);
    }
}

/// Success values, minus the recorder's own.
fn success_values(recording: &switchboard_testing::Recording) -> Vec<Value> {
    recording
        .events()
        .into_iter()
        .filter(|e| e.name() == "Success")
        .filter(|e| e.handler().is_some_and(|h| h.name != "record"))
        .map(|e| e.args.first().cloned().unwrap_or_default())
        .collect()
}

#[test]
fn handlers_run_by_priority_then_filters_then_declaration() {
    let harness = Harness::new();
    let ladder = harness.add(RaisedLadder);
    let done = harness.record(ladder, ["step_done"]).unwrap();

    harness
        .engine()
        .fire(ladder, Event::new("Step").on_success("step_done"))
        .unwrap();
    harness.run_until_idle();

    assert_eq!(
        success_values(&done),
        vec![json!(false), json!("five"), json!("zero"), json!("below")]
    );
}

#[test]
fn equal_priorities_keep_declaration_order() {
    let harness = Harness::new();
    let ladder = harness.add(Ladder);

    let value = harness.engine().send(ladder, Event::new("Step")).unwrap();

    // "below" runs last and its value wins.
    assert_eq!(value, Some(json!("below")));
    assert_eq!(harness.engine().handler_count(ladder), 4);
}

struct Base;

impl Component for Base {
    fn channel(&self) -> &str {
        "svc"
    }

    fn handlers(set: &mut HandlerSet<Self>) {
        set.on("hello", |_, _, _: Payload<'_>| "base");
        set.on("ping", |_, _, _: Payload<'_>| "pong");
    }
}

struct Derived {
    base: Base,
}

impl Component for Derived {
    fn channel(&self) -> &str {
        "svc"
    }

    fn handlers(set: &mut HandlerSet<Self>) {
        set.include_from(|d: &mut Derived| &mut d.base);
        set.on("hello", |_, _, _: Payload<'_>| "derived").overrides();
    }
}

#[test]
fn overriding_handlers_replace_included_ones() {
    let harness = Harness::new();
    let svc = harness.add(Derived { base: Base });
    let engine = harness.engine();

    assert_eq!(engine.handler_count(svc), 2);
    assert_eq!(
        engine.send(svc, Event::new("Hello")).unwrap(),
        Some(json!("derived"))
    );
    assert_eq!(
        engine.send(svc, Event::new("Ping")).unwrap(),
        Some(json!("pong"))
    );
}

struct Echo;

impl Component for Echo {
    fn channel(&self) -> &str {
        "echo"
    }

    fn handlers(set: &mut HandlerSet<Self>) {
        set.on("ping", |_, _, _: Payload<'_>| "pong");
        set.on("marco", |_, _, _: Payload<'_>| "polo");
    }
}

/// Hears `ping` whatever the target.
struct Eavesdropper;

impl Component for Eavesdropper {
    fn channel(&self) -> &str {
        "spy"
    }

    fn handlers(set: &mut HandlerSet<Self>) {
        set.on("ping", |_, ctx: &Context, p: Payload<'_>| {
            json!({"heard": p.arg(0).cloned(), "by": ctx.channel()})
        })
        .target(ANY);
    }
}

#[test]
fn wildcard_routes_widen_delivery() {
    let harness = Harness::new();
    let echo = harness.add(Echo);
    let spy = harness.add(Eavesdropper);
    harness.engine().register(spy, echo).unwrap();
    let seen = harness.record(echo, ["done"]).unwrap();
    harness.run_until_idle();

    // Channel "*": every handler bound to the target.
    harness
        .engine()
        .fire(
            echo,
            Event::new("Anything").channel(ANY).on_success("done"),
        )
        .unwrap();
    harness.run_until_idle();
    let mut values = success_values(&seen);
    values.sort_by_key(|v| v.to_string());
    assert_eq!(values, vec![json!("polo"), json!("pong")]);

    // A `*`-targeted handler hears pings addressed elsewhere.
    seen.clear();
    harness
        .engine()
        .fire(echo, event!(Ping, 7).on_success("done"))
        .unwrap();
    harness.run_until_idle();
    assert_eq!(
        success_values(&seen),
        vec![json!("pong"), json!({"heard": 7, "by": "spy"})]
    );
}

#[test]
fn feedback_events_name_their_source() {
    let harness = Harness::new();
    let echo = harness.add(Echo);
    let all = harness.record_all(echo).unwrap();

    harness
        .engine()
        .fire(
            echo,
            Event::new("Ping")
                .on_start("ping_start")
                .on_end("ping_end"),
        )
        .unwrap();
    harness.run_until_idle();

    let start = all.last("Start").expect("start feedback");
    assert_eq!(start.source().map(|s| s.name()), Some("Ping"));
    let end = all.last("End").expect("end feedback");
    assert_eq!(end.args, vec![json!("pong")]);
    assert_eq!(
        end.handler().map(|h| h.component),
        Some(echo)
    );
}
