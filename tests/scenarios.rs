//! End-to-end scenarios, one per behavior described for the whole crate
//! rather than a single module. Grounded on the teacher workspace's sibling
//! `aria-interpreter` crate's `tests/integration_tests.rs` layout.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ward::{acquire, each, provide, race, run, sleep, Channel, Cx, RuntimeConfig, RuntimeError};

/// Install a `tracing` subscriber once per test binary, so the `debug!`/
/// `warn!` calls scattered through the runtime show up under
/// `cargo test -- --nocapture`. `try_init` makes repeated calls (one per
/// test) harmless.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn scope_bounds_children() {
    init_tracing();
    let logged = Arc::new(Mutex::new(Vec::new()));
    let logged2 = Arc::clone(&logged);

    let task = run(RuntimeConfig::default(), move |cx| {
        let child = cx.spawn(move |cx| {
            for i in 1..=10u32 {
                sleep(cx, Duration::from_millis(20))?;
                logged2.lock().unwrap().push(i);
            }
            Ok::<_, RuntimeError>(())
        })?;
        sleep(cx, Duration::from_millis(90))?;
        drop(child);
        Ok::<_, RuntimeError>(())
    });
    task.join().unwrap();

    let lines = logged.lock().unwrap();
    assert!(
        lines.len() < 10,
        "expected strictly fewer than 10 log lines, got {:?}",
        *lines
    );
}

#[test]
fn reverse_cleanup_order() {
    init_tracing();
    let log = Arc::new(Mutex::new(Vec::new()));
    let log_a = Arc::clone(&log);
    let log_b = Arc::clone(&log);

    let task = run(RuntimeConfig::default(), move |cx| {
        cx.ensure(move |_cx| {
            log_a.lock().unwrap().push("A");
            Ok(())
        })?;
        cx.ensure(move |_cx| {
            log_b.lock().unwrap().push("B");
            Ok(())
        })?;
        Ok::<_, RuntimeError>(())
    });
    task.join().unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["B", "A"]);
}

#[test]
fn error_halts_siblings() {
    init_tracing();
    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    let long_sleeper_finished = Arc::new(AtomicUsize::new(0));
    let long_sleeper_finished2 = Arc::clone(&long_sleeper_finished);

    let task = run(RuntimeConfig::default(), move |cx| {
        let child1 = cx.spawn(move |cx| {
            sleep(cx, Duration::from_secs(10))?;
            long_sleeper_finished2.fetch_add(1, Ordering::SeqCst);
            Ok::<_, RuntimeError>(())
        })?;
        let child2 = cx.spawn(move |cx| {
            sleep(cx, Duration::from_millis(10))?;
            Err::<(), RuntimeError>(RuntimeError::user(Boom))
        })?;
        child2.join()?;
        child1.join()?;
        Ok::<_, RuntimeError>(())
    });

    let err = task.join().unwrap_err();
    assert_eq!(err.to_string(), "boom");
    assert!(err.suppressed().is_empty());
    assert_eq!(long_sleeper_finished.load(Ordering::SeqCst), 0);
}

#[test]
fn resource_teardown_on_caller_exit() {
    init_tracing();
    let events = Arc::new(Mutex::new(Vec::new()));
    let events_provider = Arc::clone(&events);
    let events_caller = Arc::clone(&events);

    let task = run(RuntimeConfig::default(), move |cx| {
        let socket = acquire(cx, move |body_cx, handle| {
            events_provider.lock().unwrap().push("connect");
            let events_close = Arc::clone(&events_provider);
            body_cx.ensure(move |_cx| {
                events_close.lock().unwrap().push("close");
                Ok(())
            })?;
            provide(body_cx, handle, "socket")?;
            unreachable!("resumed only via halt, short-circuited by `?`");
        })?;
        assert_eq!(socket, "socket");
        events_caller.lock().unwrap().push("return");
        Ok::<_, RuntimeError>(())
    });
    task.join().unwrap();

    let log = events.lock().unwrap();
    assert_eq!(*log, vec!["connect", "return", "close"]);
}

#[test]
fn race_cancels_loser() {
    init_tracing();
    let loser_fired = Arc::new(AtomicUsize::new(0));
    let loser_fired2 = Arc::clone(&loser_fired);

    let task = run(RuntimeConfig::default(), move |cx| {
        race(
            cx,
            vec![
                Box::new(move |cx: &mut Cx| {
                    sleep(cx, Duration::from_millis(10))?;
                    Ok::<u32, RuntimeError>(1)
                }) as Box<dyn FnOnce(&mut Cx) -> Result<u32, RuntimeError> + Send>,
                Box::new(move |cx: &mut Cx| {
                    sleep(cx, Duration::from_millis(1000))?;
                    loser_fired2.fetch_add(1, Ordering::SeqCst);
                    Ok::<u32, RuntimeError>(2)
                }),
            ],
        )
    });

    assert_eq!(task.join().unwrap(), 1);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(loser_fired.load(Ordering::SeqCst), 0);
}

#[test]
fn subscription_buffering_across_sends() {
    init_tracing();
    let channel: Channel<&'static str, (u32,)> = Channel::new();
    let sub = channel.subscribe();

    let task = run(RuntimeConfig::default(), move |cx| {
        let sender = cx.spawn(move |cx| {
            channel.send("hello");
            sleep(cx, Duration::from_millis(20))?;
            channel.send("world");
            channel.close((2,));
            Ok::<_, RuntimeError>(())
        })?;

        let mut seen = Vec::new();
        let terminal = each(cx, &sub, |_cx, v| {
            seen.push(v);
            Ok(())
        })?;
        sender.join()?;
        Ok::<_, RuntimeError>((seen, terminal))
    });

    let (seen, terminal) = task.join().unwrap();
    assert_eq!(seen, vec!["hello", "world"]);
    assert_eq!(terminal, (2,));
}
