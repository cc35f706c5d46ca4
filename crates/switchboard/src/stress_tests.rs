//! Load and churn tests.

use crate::pool::{self, Job, Pool};
use crate::{Component, ComponentId, Context, Engine, EngineConfig, Event, HandlerSet, Payload, ANY};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

const TASKS: i64 = 1000;

#[derive(Default)]
struct Tally {
    results: Vec<i64>,
    noise: usize,
    /// Noise dispatched while results were still outstanding.
    noise_in_flight: usize,
}

struct Collector {
    tally: Rc<RefCell<Tally>>,
}

impl Component for Collector {
    fn channel(&self) -> &str {
        "app"
    }

    fn handlers(set: &mut HandlerSet<Self>) {
        set.on("task_success", |c: &mut Collector, _, p: Payload<'_>| {
            if let Some(n) = p.i64_arg(0) {
                c.tally.borrow_mut().results.push(n);
            }
        })
        .target(ANY);
        set.on("noise", |c: &mut Collector, _, _: Payload<'_>| {
            let mut tally = c.tally.borrow_mut();
            tally.noise += 1;
            if (tally.results.len() as i64) < TASKS {
                tally.noise_in_flight += 1;
            }
        });
    }
}

#[test]
fn pool_completes_a_thousand_tasks_while_other_events_flow() {
    let engine = Engine::new(EngineConfig::default());
    let tally = Rc::new(RefCell::new(Tally::default()));
    let app = engine.add(Collector {
        tally: tally.clone(),
    });
    let workers = engine.add(Pool::new(&engine, Some(4)));
    engine.register(workers, app).unwrap();

    for n in 0..TASKS {
        let job = Job::func(move || {
            std::thread::sleep(Duration::from_micros(50));
            Ok(json!(n * n))
        });
        engine.fire(app, pool::task(job)).unwrap();
    }

    let started = Instant::now();
    let mut fired_noise = 0;
    while (tally.borrow().results.len() as i64) < TASKS {
        assert!(
            started.elapsed() < Duration::from_secs(60),
            "only {} of {TASKS} tasks finished",
            tally.borrow().results.len()
        );
        engine.fire(app, Event::new("Noise")).unwrap();
        fired_noise += 1;
        if engine.tick() == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    for _ in 0..3 {
        engine.tick();
    }

    let tally = tally.borrow();
    let expected: i64 = (0..TASKS).map(|n| n * n).sum();
    assert_eq!(tally.results.iter().sum::<i64>(), expected);
    assert_eq!(tally.noise, fired_noise);
    assert!(
        tally.noise_in_flight > 0,
        "no events were dispatched while tasks ran"
    );
    assert_eq!(engine.suspended(), 0);

    let loads = engine
        .with_component::<Pool, _>(workers, |pool| {
            let loads = pool.loads();
            pool.shutdown();
            loads
        })
        .unwrap();
    assert_eq!(loads, vec![0, 0, 0, 0]);
}

struct Leaf;

impl Component for Leaf {
    fn channel(&self) -> &str {
        "leaf"
    }

    fn handlers(set: &mut HandlerSet<Self>) {
        set.on("registered", |_, _, _: Payload<'_>| ());
        set.on("ping", |_, ctx: &Context, _: Payload<'_>| {
            Value::from(ctx.component().index() as u64)
        });
    }
}

fn assert_consistent(engine: &Engine, leaves: &[ComponentId]) {
    let roots = engine.roots();
    let total: usize = roots.iter().map(|root| engine.handler_count(*root)).sum();
    assert_eq!(total, leaves.len() * 2, "handlers lost or duplicated");

    let mut seen: Vec<ComponentId> = roots.iter().flat_map(|root| engine.flatten(*root)).collect();
    seen.sort();
    assert_eq!(seen, leaves, "every component belongs to exactly one tree");

    for leaf in leaves {
        let root = engine.root_of(*leaf).unwrap();
        assert!(roots.contains(&root));
        assert!(root == *leaf || engine.contains(root, *leaf));
        let owned = engine
            .handlers(*leaf)
            .iter()
            .filter(|handler| handler.component == *leaf)
            .count();
        assert_eq!(owned, 2, "{leaf} lost its handlers");
    }
}

#[test]
fn random_register_unregister_keeps_trees_consistent() {
    let mut rng = fastrand::Rng::with_seed(0x5EED);
    let engine = Engine::new(EngineConfig::default());
    let leaves: Vec<ComponentId> = (0..24).map(|_| engine.add(Leaf)).collect();

    for step in 0..500 {
        let a = leaves[rng.usize(..leaves.len())];
        let b = leaves[rng.usize(..leaves.len())];
        if rng.bool() {
            match engine.register(a, b) {
                Ok(()) => assert_eq!(engine.parent_of(a), Some(b)),
                Err(err) => assert!(
                    matches!(err, crate::RuntimeError::Cycle { .. }),
                    "step {step}: {err}"
                ),
            }
        } else {
            engine.unregister(a).unwrap();
            assert_eq!(engine.parent_of(a), None);
        }
        if step % 7 == 0 {
            engine.flush();
        }
        assert_consistent(&engine, &leaves);
    }

    // Every leaf still answers on its own tree.
    while engine.flush() > 0 {}
    for leaf in &leaves {
        let root = engine.root_of(*leaf).unwrap();
        let value = engine.send(root, Event::new("Ping").target("leaf")).unwrap();
        assert!(value.is_some());
    }
}
