use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use wildmeta::config::{Backoff, WatchdogConfig};
use wildmeta::error::WildError;
use wildmeta::watchdog::{Sleeper, Watchdog};

#[derive(Default)]
struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
    }
}

fn config(timeout: Duration) -> WatchdogConfig {
    WatchdogConfig {
        timeout,
        backoff: Backoff {
            base: Duration::from_secs(20),
            step: Duration::from_secs(5),
            max: Duration::from_secs(60),
        },
    }
}

fn failing_then_ok(failures: u32) -> (Arc<AtomicU32>, impl Fn() -> Result<u32, WildError> + Send + Sync + 'static) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let op = move || {
        let call = counter.fetch_add(1, Ordering::SeqCst);
        if call < failures {
            Err(WildError::LocationStatus {
                status: 429,
                message: "rate limited".to_string(),
            })
        } else {
            Ok(call)
        }
    };
    (calls, op)
}

#[test]
fn one_cooldown_per_failure() {
    let sleeper = Arc::new(RecordingSleeper::default());
    let watchdog = Watchdog::with_sleeper(config(Duration::from_secs(5)), Arc::clone(&sleeper));
    let (calls, op) = failing_then_ok(4);

    let value = watchdog.guard("location", op);

    assert_eq!(value, 4);
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(
        *sleeper.delays.lock().unwrap(),
        vec![
            Duration::from_secs(20),
            Duration::from_secs(25),
            Duration::from_secs(30),
            Duration::from_secs(35),
        ]
    );
}

#[test]
fn cooldown_grows_until_cap() {
    let sleeper = Arc::new(RecordingSleeper::default());
    let watchdog = Watchdog::with_sleeper(config(Duration::from_secs(5)), Arc::clone(&sleeper));
    let (_, op) = failing_then_ok(12);

    watchdog.guard("climate", op);

    let delays = sleeper.delays.lock().unwrap().clone();
    assert_eq!(delays.len(), 12);
    assert!(delays.iter().all(|delay| *delay <= Duration::from_secs(60)));
    assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
    let uncapped: Vec<_> = delays
        .iter()
        .take_while(|delay| **delay < Duration::from_secs(60))
        .collect();
    assert!(uncapped.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(delays.last(), Some(&Duration::from_secs(60)));
}

#[test]
fn first_call_success_has_no_cooldown() {
    let sleeper = Arc::new(RecordingSleeper::default());
    let watchdog = Watchdog::with_sleeper(config(Duration::from_secs(5)), Arc::clone(&sleeper));

    let value = watchdog.guard("water", || Ok::<_, WildError>(Some(12.5)));

    assert_eq!(value, Some(12.5));
    assert!(sleeper.delays.lock().unwrap().is_empty());
}

#[test]
fn hung_attempt_is_abandoned_after_timeout() {
    let sleeper = Arc::new(RecordingSleeper::default());
    let watchdog = Watchdog::with_sleeper(config(Duration::from_millis(100)), Arc::clone(&sleeper));
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);

    let value = watchdog.guard("vegetation", move || {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            thread::sleep(Duration::from_secs(2));
            return Ok::<_, WildError>("late");
        }
        Ok("fresh")
    });

    assert_eq!(value, "fresh");
    assert_eq!(
        *sleeper.delays.lock().unwrap(),
        vec![Duration::from_secs(20), Duration::from_secs(25)]
    );
}
