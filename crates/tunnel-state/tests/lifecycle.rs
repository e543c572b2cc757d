//! Lifecycle tests for ConnectionState: stop, close fan-out, watchdog,
//! delayed start and temp path ordering.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Barrier;
use tokio::time::{Instant, timeout};
use tunnel_state::{
    Connection, ConnectionState, Options, Phase, Profile, RecordingSink, ShutdownFlag,
    StateEvent,
};

fn state_with(options: Options) -> (ConnectionState, Arc<RecordingSink>, Arc<ShutdownFlag>) {
    let sink = Arc::new(RecordingSink::new());
    let flag = Arc::new(ShutdownFlag::new());
    let state = ConnectionState::builder()
        .sink(sink.clone())
        .shutdown_flag(flag.clone())
        .init(options)
        .unwrap();
    (state, sink, flag)
}

fn dead_states(sink: &RecordingSink) -> usize {
    sink.count(StateEvent::is_dead_state)
}

#[tokio::test]
async fn test_repeated_stop_has_one_effect() {
    let (state, sink, _) = state_with(Options::default());

    for _ in 0..5 {
        state.stop();
        assert!(state.is_stop());
    }

    assert_eq!(state.phase(), Phase::Stopping);
    assert_eq!(sink.count(|e| *e == StateEvent::AlreadyStopping), 4);
}

#[tokio::test]
async fn test_concurrent_stop_has_one_effect() {
    let (state, sink, _) = state_with(Options::default());

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let state = state.clone();
            tokio::spawn(async move { state.stop() })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(state.is_stop());
    assert_eq!(sink.count(|e| *e == StateEvent::AlreadyStopping), 15);
}

#[tokio::test]
async fn test_close_releases_each_waiter_once() {
    let (state, sink, _) = state_with(Options::default());
    let released = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let waiter = state.close_waiter();
            let released = released.clone();
            tokio::spawn(async move {
                waiter.wait().await;
                released.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    assert_eq!(state.pending_waiters(), 10);
    assert_eq!(released.load(Ordering::SeqCst), 0);

    state.close();
    state.close();

    for handle in handles {
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }

    assert_eq!(released.load(Ordering::SeqCst), 10);
    assert_eq!(state.pending_waiters(), 0);

    let closed: Vec<_> = sink
        .events()
        .into_iter()
        .filter(|r| matches!(r.event, StateEvent::Closed { .. }))
        .collect();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].event, StateEvent::Closed { released: 10 });
}

#[tokio::test]
async fn test_close_wait_after_close_returns() {
    let (state, _, _) = state_with(Options::default());
    state.close();

    timeout(Duration::from_millis(20), state.close_wait())
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_close_wait_blocks_until_close() {
    let (state, _, _) = state_with(Options::default());

    let waiting = state.clone();
    let handle = tokio::spawn(async move { waiting.close_wait().await });

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!handle.is_finished());
    assert_eq!(state.pending_waiters(), 1);

    let closed_at = Instant::now();
    state.close();
    handle.await.unwrap();

    // Released waiters settle for the close grace before returning
    assert!(closed_at.elapsed() >= Duration::from_millis(50));
}

#[tokio::test]
async fn test_process_flag_independent_of_own_stop() {
    let (state, _, flag) = state_with(Options::default());
    assert!(!state.is_stop());

    flag.set_shutdown();
    assert!(state.is_stop());
    assert_eq!(state.phase(), Phase::Running);

    flag.clear();
    assert!(!state.is_stop());
    assert_eq!(state.phase(), Phase::Running);
}

#[tokio::test]
async fn test_process_flag_shared_between_connections() {
    let flag = Arc::new(ShutdownFlag::new());
    let conns: Vec<_> = (0..3)
        .map(|_| {
            let builder = ConnectionState::builder().shutdown_flag(flag.clone());
            Connection::with_state(Profile::default(), builder, Options::default()).unwrap()
        })
        .collect();

    conns[0].state().stop();
    assert!(conns[0].state().is_stop());
    assert!(!conns[1].state().is_stop());

    flag.set_shutdown();
    assert!(conns.iter().all(|c| c.state().is_stop()));
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_reports_stall_once_per_threshold() {
    let (state, sink, _) = state_with(Options::default());

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert_eq!(dead_states(&sink), 0);

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(dead_states(&sink), 1);

    // Continued silence: one more report per threshold, not per tick
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(dead_states(&sink), 1);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(dead_states(&sink), 2);

    let record = sink
        .events()
        .into_iter()
        .find(|r| r.event.is_dead_state())
        .unwrap();
    match record.event {
        StateEvent::DeadState { last_check, trace } => {
            assert_eq!(last_check, state.start_time());
            assert!(trace.contains("lifecycle.rs"));
        }
        other => panic!("unexpected event {:?}", other),
    }

    // Never forces a stop
    assert_eq!(state.phase(), Phase::Running);
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_reports_last_heartbeat() {
    let (state, sink, _) = state_with(Options::default());

    tokio::time::sleep(Duration::from_secs(10)).await;
    let line = line!() + 1;
    assert!(!state.is_stop());
    let heartbeat = state.last_health_check();

    // Silent from t=10s; the first report is due once t passes 70s
    tokio::time::sleep(Duration::from_secs(59)).await;
    assert_eq!(dead_states(&sink), 0);

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert_eq!(dead_states(&sink), 1);

    let record = sink
        .events()
        .into_iter()
        .find(|r| r.event.is_dead_state())
        .unwrap();
    match record.event {
        StateEvent::DeadState { last_check, trace } => {
            assert_eq!(last_check, heartbeat.wall);
            assert!(
                trace.contains(&format!("lifecycle.rs:{}:", line)),
                "trace {} does not point at line {}",
                trace,
                line
            );
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_quiet_with_heartbeat() {
    let (state, sink, _) = state_with(Options::default());

    for _ in 0..150 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!state.is_stop());
    }

    assert_eq!(dead_states(&sink), 0);
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_stops_after_close() {
    let (state, sink, _) = state_with(Options::default());
    state.close();

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(dead_states(&sink), 0);
}

#[tokio::test(start_paused = true)]
async fn test_delayed_pre_start_waits() {
    let (state, _, _) = state_with(Options {
        delay: true,
        ..Default::default()
    });

    let started = Instant::now();
    state.pre_start().await;
    assert!(started.elapsed() >= Duration::from_millis(3000));
}

#[tokio::test(start_paused = true)]
async fn test_immediate_pre_start() {
    let (state, _, _) = state_with(Options::default());

    let started = Instant::now();
    state.pre_start().await;
    assert!(started.elapsed() < Duration::from_millis(1));
}

#[tokio::test]
async fn test_paths_keep_registration_order() {
    let (state, _, _) = state_with(Options::default());

    state.add_path("a");
    state.add_path("b");
    state.add_path("c");

    assert_eq!(
        state.take_paths(),
        vec![PathBuf::from("a"), PathBuf::from("b"), PathBuf::from("c")]
    );
}

fn closed_released(sink: &RecordingSink) -> Vec<usize> {
    sink.events()
        .into_iter()
        .filter_map(|r| match r.event {
            StateEvent::Closed { released } => Some(released),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hundred_registered_waiters_released_once() {
    let (state, sink, _) = state_with(Options::default());
    let released = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let waiter = state.close_waiter();
            let released = released.clone();
            tokio::spawn(async move {
                waiter.wait().await;
                released.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    assert_eq!(state.pending_waiters(), 100);

    let closer = state.clone();
    tokio::spawn(async move { closer.close() }).await.unwrap();

    for handle in handles {
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
    assert_eq!(released.load(Ordering::SeqCst), 100);
    assert_eq!(state.pending_waiters(), 0);
    assert_eq!(closed_released(&sink), vec![100]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_races_in_flight_registrations() {
    for _ in 0..20 {
        let (state, sink, _) = state_with(Options::default());
        let barrier = Arc::new(Barrier::new(101));

        let waiters: Vec<_> = (0..100)
            .map(|_| {
                let state = state.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    let waiter = state.close_waiter();
                    let registered_before_close = !waiter.is_ready();
                    waiter.wait().await;
                    registered_before_close
                })
            })
            .collect();

        let closer = {
            let state = state.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                state.close();
            })
        };

        let mut registered = 0;
        for handle in waiters {
            if timeout(Duration::from_secs(5), handle).await.unwrap().unwrap() {
                registered += 1;
            }
        }
        closer.await.unwrap();

        // Every waiter returned, and the drain counted exactly the ones
        // that got in ahead of close
        assert_eq!(closed_released(&sink), vec![registered]);
        assert_eq!(state.pending_waiters(), 0);
    }
}
