//! Dispense actuator adapter.
//!
//! Wraps a [`MachineDriver`] (touch sensor, motor, buzzer) and re-publishes
//! its debounced touch events through a registry so any number of
//! consumers can listen without the driver knowing about them.
//!
//! | Output | Meaning                           |
//! |--------|-----------------------------------|
//! | motor  | dispense mechanism on/off         |
//! | buzzer | audible feedback on/off           |
//! | touch  | `true` = begin, `false` = release |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::select;
use log::{debug, info, warn};

use crate::app::lifecycle::{ShutdownSignal, TaskSet};
use crate::app::ports::MachineDriver;
use crate::error::{Error, Result};
use crate::pubsub::{Subscription, SubscriptionRegistry};

struct Running {
    done: ShutdownSignal,
    tasks: TaskSet,
}

pub struct DispenseActuator {
    driver: Arc<dyn MachineDriver>,
    touches: SubscriptionRegistry<bool>,
    motor_on: AtomicBool,
    buzzer_on: AtomicBool,
    running: Mutex<Option<Running>>,
}

impl DispenseActuator {
    pub fn new(driver: Arc<dyn MachineDriver>, subscriber_depth: usize) -> Self {
        Self {
            driver,
            touches: SubscriptionRegistry::new("touch", subscriber_depth),
            motor_on: AtomicBool::new(false),
            buzzer_on: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    /// Start the driver and begin forwarding its touch events.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return Ok(());
        }
        self.driver
            .start()
            .map_err(|e| Error::driver("machine_start", e))?;

        let done = ShutdownSignal::new();
        let done_rx = done.receiver();
        let source = self.driver.subscribe_touches();
        let touches = self.touches.clone();
        let mut tasks = TaskSet::new();
        let spawned = tasks.spawn("touch", move || {
            loop {
                select! {
                    recv(done_rx) -> _ => break,
                    recv(source.receiver()) -> msg => match msg {
                        Ok(touched) => {
                            debug!("Machine: touch {}", if touched { "begin" } else { "end" });
                            touches.broadcast(touched);
                        }
                        Err(_) => {
                            warn!("Machine: touch source closed");
                            touches.shutdown();
                            break;
                        }
                    },
                }
            }
        });
        if let Err(e) = spawned {
            self.driver.stop();
            return Err(e);
        }
        info!("Machine: started");
        *running = Some(Running { done, tasks });
        Ok(())
    }

    /// Silence the outputs and stop the driver.  Safe when never started.
    pub fn stop(&self, join_timeout: Duration) {
        let Some(mut running) = self.running.lock().unwrap_or_else(PoisonError::into_inner).take()
        else {
            return;
        };
        self.toggle_motor(false);
        self.toggle_buzzer(false);
        running.done.fire();
        running.tasks.join_all(join_timeout);
        self.driver.stop();
        info!("Machine: stopped");
    }

    pub fn subscribe_touches(&self) -> Subscription<bool> {
        self.touches.subscribe()
    }

    pub fn toggle_motor(&self, on: bool) {
        self.driver.toggle_motor(on);
        self.motor_on.store(on, Ordering::Release);
    }

    pub fn toggle_buzzer(&self, on: bool) {
        self.driver.toggle_buzzer(on);
        self.buzzer_on.store(on, Ordering::Release);
    }

    /// Two short buzzer pulses, used once after a successful start.
    pub fn diagnostic_noise(&self) {
        self.driver.diagnostic_noise();
    }

    pub fn motor_on(&self) -> bool {
        self.motor_on.load(Ordering::Acquire)
    }

    pub fn buzzer_on(&self) -> bool {
        self.buzzer_on.load(Ordering::Acquire)
    }

    pub fn shutdown_subscribers(&self) {
        self.touches.shutdown();
    }
}

impl Drop for DispenseActuator {
    fn drop(&mut self) {
        self.stop(Duration::from_millis(500));
    }
}
