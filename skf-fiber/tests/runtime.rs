#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

use skf_core::RaftError;
use skf_fiber::{
    Dispatcher, FiberChannel, FiberCondition, FiberFuture, FiberGroup, IoExecutor, io_retry, sleep,
    with_deadline,
};

fn wait_group(dispatcher: &Dispatcher, name: &str) -> skf_fiber::GroupHandle {
    dispatcher.create_group(name)
}

#[test]
fn test_future_completed_from_foreign_thread() {
    let dispatcher = Dispatcher::new("t1");
    let group = wait_group(&dispatcher, "g1");
    let (out_tx, out_rx) = mpsc::channel::<u64>();

    let (future, completer) = FiberFuture::<u64>::new();
    group.spawn("waiter", false, move || async move {
        let value = future.await?;
        out_tx.send(value).ok();
        Ok(())
    });

    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        completer.complete(Ok(42));
    });

    assert_eq!(out_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    group.request_shutdown();
    group.join();
}

#[test]
fn test_channel_cross_thread_send() {
    let dispatcher = Dispatcher::new("t2");
    let group = wait_group(&dispatcher, "g2");
    let (out_tx, out_rx) = mpsc::channel::<Vec<u32>>();
    let (chan_tx, chan_rx) = mpsc::channel();

    group.spawn("consumer", false, move || async move {
        let (channel, sender) = FiberChannel::<u32>::new();
        chan_tx.send(sender).ok();
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(channel.recv().await?);
        }
        out_tx.send(seen).ok();
        Ok(())
    });

    let sender = chan_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    for v in [7, 8, 9] {
        sender.send(v);
    }
    assert_eq!(
        out_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        vec![7, 8, 9]
    );
    group.request_shutdown();
    group.join();
}

#[test]
fn test_sleep_elapses() {
    let dispatcher = Dispatcher::new("t3");
    let group = wait_group(&dispatcher, "g3");
    let (out_tx, out_rx) = mpsc::channel::<Duration>();

    group.spawn("sleeper", false, move || async move {
        let start = Instant::now();
        sleep(Duration::from_millis(50)).await?;
        out_tx.send(start.elapsed()).ok();
        Ok(())
    });

    let elapsed = out_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(elapsed >= Duration::from_millis(50), "slept {elapsed:?}");
    group.request_shutdown();
    group.join();
}

#[test]
fn test_deadline_times_out() {
    let dispatcher = Dispatcher::new("t4");
    let group = wait_group(&dispatcher, "g4");
    let (out_tx, out_rx) = mpsc::channel::<bool>();

    group.spawn("timeout", false, move || async move {
        let (future, _completer) = FiberFuture::<()>::new();
        let result = future.deadline(Instant::now() + Duration::from_millis(30)).await;
        out_tx
            .send(matches!(result, Err(RaftError::Timeout)))
            .ok();
        Ok(())
    });

    assert!(out_rx.recv_timeout(Duration::from_secs(5)).unwrap());
    group.request_shutdown();
    group.join();
}

#[test]
fn test_shutdown_cancels_blocked_fibers() {
    let dispatcher = Dispatcher::new("t5");
    let group = wait_group(&dispatcher, "g5");
    let (out_tx, out_rx) = mpsc::channel::<bool>();

    group.spawn("blocked", false, move || async move {
        let (future, _completer) = FiberFuture::<()>::new();
        let result = future.await;
        out_tx
            .send(matches!(result, Err(RaftError::FiberCancel)))
            .ok();
        // Propagate so the fiber ends.
        result
    });

    std::thread::sleep(Duration::from_millis(30));
    group.request_shutdown();
    assert!(out_rx.recv_timeout(Duration::from_secs(5)).unwrap());
    group.join();
    assert!(group.is_finished());
}

#[test]
fn test_daemon_does_not_keep_group_alive() {
    let dispatcher = Dispatcher::new("t6");
    let group = wait_group(&dispatcher, "g6");

    group.spawn("daemon", true, || async {
        // Blocks forever; must not prevent group finish.
        let (future, _completer) = FiberFuture::<()>::new();
        future.await?;
        Ok(())
    });
    group.spawn("normal", false, || async {
        sleep(Duration::from_millis(10)).await?;
        Ok(())
    });

    std::thread::sleep(Duration::from_millis(50));
    group.request_shutdown();
    group.join();
    assert!(group.is_finished());
}

#[test]
fn test_io_executor_roundtrip() {
    let dispatcher = Dispatcher::new("t7");
    let group = wait_group(&dispatcher, "g7");
    let executor = Arc::new(IoExecutor::new("t7", 2));
    let (out_tx, out_rx) = mpsc::channel::<u64>();

    let exec = Arc::clone(&executor);
    group.spawn("io", false, move || async move {
        let value = exec.submit(|| Ok(21u64 * 2)).await?;
        out_tx.send(value).ok();
        Ok(())
    });

    assert_eq!(out_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    group.request_shutdown();
    group.join();
}

#[test]
fn test_io_executor_keyed_ordering() {
    let dispatcher = Dispatcher::new("t8");
    let group = wait_group(&dispatcher, "g8");
    let executor = Arc::new(IoExecutor::new("t8", 4));
    let (out_tx, out_rx) = mpsc::channel::<Vec<u32>>();

    let exec = Arc::clone(&executor);
    group.spawn("keyed", false, move || async move {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut futures = Vec::new();
        for i in 0..16u32 {
            let log = Arc::clone(&log);
            futures.push(exec.submit_keyed(7, move || {
                log.lock().unwrap().push(i);
                Ok(())
            }));
        }
        for f in futures {
            f.await?;
        }
        out_tx.send(log.lock().unwrap().clone()).ok();
        Ok(())
    });

    let order = out_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(order, (0..16).collect::<Vec<_>>());
    group.request_shutdown();
    group.join();
}

#[test]
fn test_io_retry_backs_off_then_succeeds() {
    let dispatcher = Dispatcher::new("t9");
    let group = wait_group(&dispatcher, "g9");
    let (out_tx, out_rx) = mpsc::channel::<u32>();

    group.spawn("retry", false, move || async move {
        let attempts = Arc::new(AtomicUsize::new(0));
        let intervals = [Duration::from_millis(5), Duration::from_millis(10)];
        let counter = Arc::clone(&attempts);
        let value = io_retry(&intervals, move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RaftError::Io(std::io::Error::other("transient")))
                } else {
                    Ok(5u32)
                }
            }
        })
        .await?;
        out_tx.send(value).ok();
        Ok(())
    });

    assert_eq!(out_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 5);
    group.request_shutdown();
    group.join();
}

#[test]
fn test_interrupt_wakes_sleeper() {
    let dispatcher = Dispatcher::new("t10");
    let group = wait_group(&dispatcher, "g10");
    let (out_tx, out_rx) = mpsc::channel::<bool>();

    group.spawn("parent", false, move || async move {
        let current = FiberGroup::current()
            .ok_or_else(|| RaftError::Internal("no group".into()))?;
        let (done_tx, done_rx) = mpsc::channel::<bool>();
        let child = current.spawn("child", async move {
            let result = sleep(Duration::from_secs(3600)).await;
            done_tx
                .send(matches!(result, Err(RaftError::FiberInterrupt)))
                .ok();
            result
        });
        sleep(Duration::from_millis(20)).await?;
        child.interrupt();
        // Give the child a chance to observe the signal.
        sleep(Duration::from_millis(20)).await?;
        out_tx
            .send(done_rx.try_recv().unwrap_or(false))
            .ok();
        Ok(())
    });

    assert!(out_rx.recv_timeout(Duration::from_secs(5)).unwrap());
    group.request_shutdown();
    group.join();
}

#[test]
fn test_condition_wakes_all_waiters() {
    let dispatcher = Dispatcher::new("t11");
    let group = wait_group(&dispatcher, "g11");
    let (out_tx, out_rx) = mpsc::channel::<usize>();

    group.spawn("cond", false, move || async move {
        let current = FiberGroup::current()
            .ok_or_else(|| RaftError::Internal("no group".into()))?;
        let cond = FiberCondition::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let cond = cond.clone();
            let counter = Arc::clone(&counter);
            current.spawn(format!("waiter-{i}"), async move {
                cond.wait().await?;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        sleep(Duration::from_millis(20)).await?;
        cond.signal_all();
        sleep(Duration::from_millis(20)).await?;
        out_tx.send(counter.load(Ordering::SeqCst)).ok();
        Ok(())
    });

    assert_eq!(out_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 3);
    group.request_shutdown();
    group.join();
}

#[test]
fn test_with_deadline_passes_through_success() {
    let dispatcher = Dispatcher::new("t12");
    let group = wait_group(&dispatcher, "g12");
    let (out_tx, out_rx) = mpsc::channel::<u8>();

    group.spawn("fast", false, move || async move {
        let (future, completer) = FiberFuture::<u8>::new();
        completer.complete(Ok(9));
        let value = with_deadline(future, Instant::now() + Duration::from_secs(1)).await?;
        out_tx.send(value).ok();
        Ok(())
    });

    assert_eq!(out_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 9);
    group.request_shutdown();
    group.join();
}
