//! GPIO dispense machine (motor relay, piezo buzzer, capacitive touch pad).
//!
//! Implements [`MachineDriver`] over any `embedded-hal` 1.0 digital pins,
//! so the same code drives a Linux GPIO character device, an MCU HAL, or
//! the in-memory [`SimPin`] used on the host.
//!
//! ## Touch debounce
//!
//! The touch pad is sampled every [`TOUCH_POLL_MS`].  A level change is
//! only reported once it has been stable for [`TOUCH_DEBOUNCE_MS`]:
//!
//! | Raw level        | Held for           | Event          |
//! |------------------|--------------------|----------------|
//! | low → high       | >= debounce window | `true` (begin) |
//! | high → low       | >= debounce window | `false` (end)  |
//! | glitch           | < debounce window  | none           |

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use embedded_hal::digital::{ErrorType, InputPin, OutputPin};
use log::{debug, info, warn};

use crate::app::lifecycle::{ShutdownSignal, TaskSet};
use crate::app::ports::MachineDriver;
use crate::error::DriverError;
use crate::pubsub::{Subscription, SubscriptionRegistry};

pub const TOUCH_POLL_MS: u64 = 1;
pub const TOUCH_DEBOUNCE_MS: u64 = 2;
pub const NOISE_PULSE_MS: u64 = 200;

// ───────────────────────────────────────────────────────────────
// Debounce state machine
// ───────────────────────────────────────────────────────────────

/// Pure debounce logic, fed with `(level, now_ms)` samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TouchDebouncer {
    stable: bool,
    candidate: Option<(bool, u64)>,
    window_ms: u64,
}

impl TouchDebouncer {
    pub fn new(window_ms: u64) -> Self {
        Self {
            stable: false,
            candidate: None,
            window_ms,
        }
    }

    /// Returns the new stable level when a change has settled.
    pub fn sample(&mut self, level: bool, now_ms: u64) -> Option<bool> {
        if level == self.stable {
            self.candidate = None;
            return None;
        }
        match self.candidate {
            Some((pending, since)) if pending == level => {
                if now_ms.saturating_sub(since) >= self.window_ms {
                    self.stable = level;
                    self.candidate = None;
                    return Some(level);
                }
                None
            }
            _ => {
                self.candidate = Some((level, now_ms));
                None
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────
// GpioMachine
// ───────────────────────────────────────────────────────────────

pub struct GpioMachine<M, B, T> {
    motor: Mutex<M>,
    buzzer: Mutex<B>,
    touch: Arc<Mutex<T>>,
    touches: SubscriptionRegistry<bool>,
    poller: Mutex<Option<(ShutdownSignal, TaskSet)>>,
}

fn lock<P>(pin: &Mutex<P>) -> MutexGuard<'_, P> {
    pin.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<M, B, T> GpioMachine<M, B, T>
where
    M: OutputPin + Send,
    B: OutputPin + Send,
    T: InputPin + Send + 'static,
{
    pub fn new(motor: M, buzzer: B, touch: T) -> Self {
        Self {
            motor: Mutex::new(motor),
            buzzer: Mutex::new(buzzer),
            touch: Arc::new(Mutex::new(touch)),
            touches: SubscriptionRegistry::new("gpio-touch", 8),
            poller: Mutex::new(None),
        }
    }

    fn drive<P: OutputPin>(pin: &Mutex<P>, label: &str, on: bool) {
        let mut pin = lock(pin);
        let result = if on { pin.set_high() } else { pin.set_low() };
        if result.is_err() {
            warn!("GPIO: {} write failed", label);
        }
    }
}

impl<M, B, T> MachineDriver for GpioMachine<M, B, T>
where
    M: OutputPin + Send,
    B: OutputPin + Send,
    T: InputPin + Send + 'static,
{
    fn start(&self) -> Result<(), DriverError> {
        let mut poller = lock(&self.poller);
        if poller.is_some() {
            return Ok(());
        }
        Self::drive(&self.motor, "motor", false);
        Self::drive(&self.buzzer, "buzzer", false);

        let done = ShutdownSignal::new();
        let signal = done.clone();
        let touch = Arc::clone(&self.touch);
        let touches = self.touches.clone();
        let mut tasks = TaskSet::new();
        tasks
            .spawn("gpio-touch", move || {
                let epoch = Instant::now();
                let mut debouncer = TouchDebouncer::new(TOUCH_DEBOUNCE_MS);
                while !signal.wait_timeout(Duration::from_millis(TOUCH_POLL_MS)) {
                    let Ok(level) = lock(&touch).is_high() else {
                        continue;
                    };
                    let now_ms = epoch.elapsed().as_millis() as u64;
                    if let Some(touched) = debouncer.sample(level, now_ms) {
                        debug!("GPIO: touch {}", touched);
                        touches.broadcast(touched);
                    }
                }
            })
            .map_err(|e| DriverError::Unavailable(e.to_string()))?;
        info!("GPIO: machine started");
        *poller = Some((done, tasks));
        Ok(())
    }

    fn stop(&self) {
        Self::drive(&self.motor, "motor", false);
        Self::drive(&self.buzzer, "buzzer", false);
        if let Some((done, mut tasks)) = lock(&self.poller).take() {
            done.fire();
            tasks.join_all(Duration::from_millis(100));
            info!("GPIO: machine stopped");
        }
    }

    fn toggle_motor(&self, on: bool) {
        Self::drive(&self.motor, "motor", on);
    }

    fn toggle_buzzer(&self, on: bool) {
        Self::drive(&self.buzzer, "buzzer", on);
    }

    fn diagnostic_noise(&self) {
        let pulse = Duration::from_millis(NOISE_PULSE_MS);
        for _ in 0..2 {
            Self::drive(&self.buzzer, "buzzer", true);
            thread::sleep(pulse);
            Self::drive(&self.buzzer, "buzzer", false);
            thread::sleep(pulse);
        }
    }

    fn subscribe_touches(&self) -> Subscription<bool> {
        self.touches.subscribe()
    }
}

// ───────────────────────────────────────────────────────────────
// Simulated pin
// ───────────────────────────────────────────────────────────────

/// In-memory pin usable as both input and output.  Clones share a level.
#[derive(Debug, Clone, Default)]
pub struct SimPin {
    level: Arc<AtomicBool>,
    rising_edges: Arc<AtomicU32>,
}

impl SimPin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> bool {
        self.level.load(Ordering::Acquire)
    }

    /// Drive the level from outside (e.g. a simulated finger).
    pub fn set(&self, high: bool) {
        if high && !self.level.swap(true, Ordering::AcqRel) {
            self.rising_edges.fetch_add(1, Ordering::Relaxed);
        } else if !high {
            self.level.store(false, Ordering::Release);
        }
    }

    pub fn rising_edges(&self) -> u32 {
        self.rising_edges.load(Ordering::Relaxed)
    }
}

impl ErrorType for SimPin {
    type Error = Infallible;
}

impl OutputPin for SimPin {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.set(true);
        Ok(())
    }
}

impl InputPin for SimPin {
    fn is_high(&mut self) -> Result<bool, Infallible> {
        Ok(self.level())
    }

    fn is_low(&mut self) -> Result<bool, Infallible> {
        Ok(!self.level())
    }
}
