use std::sync::Arc;
use std::time::Duration;

use crate::domain::{DateWindow, GeoPoint};
use crate::error::WildError;
use crate::watchdog::Sleeper;

/// A live handle to the stateful raster service backing the vegetation and
/// water-distance lookups.
pub trait EarthSession: Send + Sync + 'static {
    /// Mean raw NDVI of the window's median image around `point`, or `None`
    /// when the window has no imagery or no value.
    fn ndvi_mean(&self, point: GeoPoint, window: DateWindow) -> Result<Option<f64>, WildError>;

    /// Distance to the nearest stream in metres, `None` when the raster is empty there.
    fn stream_distance(&self, point: GeoPoint) -> Result<Option<f64>, WildError>;

    /// Must be idempotent. Calls made after closing fail with `SessionClosed`.
    fn close(&self) -> Result<(), WildError>;
}

pub trait SessionFactory {
    type Session: EarthSession;

    fn open(&self) -> Result<Self::Session, WildError>;
}

/// Owns the single live session. `reset` is called at every batch boundary.
pub struct SessionManager<F: SessionFactory, S: Sleeper> {
    factory: F,
    sleeper: S,
    retry_delay: Duration,
    current: Option<Arc<F::Session>>,
    generation: u64,
}

impl<F: SessionFactory, S: Sleeper> SessionManager<F, S> {
    pub fn new(factory: F, sleeper: S, retry_delay: Duration) -> Self {
        Self {
            factory,
            sleeper,
            retry_delay,
            current: None,
            generation: 0,
        }
    }

    /// Tears down the current handle (errors ignored) and opens a new one,
    /// retrying until initialization succeeds.
    pub fn reset(&mut self) -> Arc<F::Session> {
        self.close();
        let mut attempt = 0u32;
        let session = loop {
            attempt += 1;
            match self.factory.open() {
                Ok(session) => break Arc::new(session),
                Err(err) => {
                    tracing::warn!(
                        attempt,
                        retry_secs = self.retry_delay.as_secs_f64(),
                        error = %err,
                        "session initialization failed; retrying"
                    );
                    self.sleeper.sleep(self.retry_delay);
                }
            }
        };
        self.generation += 1;
        tracing::info!(generation = self.generation, "session ready");
        self.current = Some(Arc::clone(&session));
        session
    }

    pub fn close(&mut self) {
        if let Some(session) = self.current.take() {
            if let Err(err) = session.close() {
                tracing::warn!(error = %err, "session teardown failed; discarding handle");
            }
        }
    }

    /// The live handle, if a batch has opened one and it is not yet closed.
    pub fn current(&self) -> Option<&Arc<F::Session>> {
        self.current.as_ref()
    }

    /// Number of sessions opened so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl<F: SessionFactory, S: Sleeper> Drop for SessionManager<F, S> {
    fn drop(&mut self) {
        self.close();
    }
}
