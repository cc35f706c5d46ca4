//! # Hello Example
//!
//! The smallest useful tree: one component, a filter guarding one handler,
//! and feedback channels for both outcomes. Run with
//! `RUST_LOG=switchboard=debug` to watch the dispatcher.

use anyhow::Result;
use switchboard_core::{Component, Context, Debugger, Engine, Event, HandlerSet, Payload, ANY};
use tracing::info;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Component
// ============================================================================

struct App;

impl App {
    fn hello(&mut self, _ctx: &Context, payload: Payload<'_>) -> String {
        format!("Hello {}!", payload.str_arg(0).unwrap_or("World"))
    }

    /// Nobody gets greeted.
    fn censor(&mut self, _ctx: &Context, payload: Payload<'_>) -> bool {
        payload.str_arg(0) == Some("nobody")
    }

    fn filtered(&mut self, _ctx: &Context, _payload: Payload<'_>) {
        println!("(one greeting was filtered)");
    }

    // Every handler of `Hello` reports success, the debugger's included.
    fn greeted(&mut self, ctx: &Context, payload: Payload<'_>) {
        if let Some(greeting) = payload.str_arg(0) {
            println!("{greeting}");
            ctx.stop();
        }
    }
}

impl Component for App {
    fn channel(&self) -> &str {
        "app"
    }

    fn handlers(set: &mut HandlerSet<Self>) {
        set.on("hello", App::hello);
        set.on("hello", App::censor).filter().priority(10.0);
        set.on("hello_success", App::greeted);
        set.on("hello_filtered", App::filtered);
        set.on("started", |_: &mut App, ctx: &Context, _: Payload<'_>| {
            info!("app started");
            for name in ["nobody", "Switchboard"] {
                ctx.fire(
                    Event::new("Hello")
                        .arg(name)
                        .on_success("hello_success")
                        .on_filter("hello_filtered"),
                )?;
            }
            anyhow::Ok(())
        })
        .target(ANY);
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let engine = Engine::builder().signals(true).build();
    let app = engine.add(App);
    let debugger = engine.add(Debugger::new().ignore_event("Registered"));
    engine.register(debugger, app)?;

    engine.run().await
}
