//! Adapters — concrete implementations of the hexagonal port traits.
//!
//! | Adapter     | Implements          | Connects to                     |
//! |-------------|---------------------|---------------------------------|
//! | `gpio`      | MachineDriver       | embedded-hal motor/buzzer/touch |
//! | `wifi`      | ConnectivityDriver  | Simulated station               |
//! |             | IpRenewal           | Log only                        |
//! | `lightning` | NodeDriverFactory   | Simulated payment nodes         |
//! | `nvs`       | SettingsStore       | postcard snapshot file / memory |
//! | `exposure`  | ServiceExposure     | Local listener, key-derived id  |
//! | `updater`   | UpdateManager       | None (reports unavailable)      |
//! | `system`    | SystemControl       | Log only                        |

pub mod exposure;
pub mod gpio;
pub mod lightning;
pub mod nvs;
pub mod system;
pub mod updater;
pub mod wifi;
