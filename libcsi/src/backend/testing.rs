//! In-memory stand-ins for the host, used by backend tests.
//!
//! [`FakeMounter`] keeps "formatted devices", "mounts" and open LUKS
//! mappings in memory and records every primitive call so tests can assert
//! what would have touched the host.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::device::DeviceResolver;
use crate::error::CsiError;
use crate::luks::{LuksContext, VolumeLifecycle, mapping_name};
use crate::mounter::Mounter;
use crate::types::VolumeId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    IsFormatted {
        source: String,
    },
    Format {
        source: String,
        fs_type: String,
        encrypted: bool,
    },
    IsMounted {
        target: String,
    },
    Mount {
        source: String,
        target: String,
        fs_type: String,
        options: Vec<String>,
        encrypted: bool,
    },
    Unmount {
        target: String,
        lifecycle: VolumeLifecycle,
    },
    CloseMapping {
        volume_id: String,
    },
    DeviceForMount {
        target: String,
    },
    Resize {
        device: String,
        target: String,
    },
}

#[derive(Debug, Default)]
struct State {
    formatted: HashSet<String>,
    /// target -> source
    mounts: HashMap<String, String>,
    /// staging target -> mapping opened underneath it
    mapped_mounts: HashMap<String, String>,
    open_mappings: HashSet<String>,
    calls: Vec<Call>,
    fail_mounts: bool,
    fail_resizes: bool,
    /// Number of upcoming mapping closes that fail.
    fail_closes: usize,
}

impl State {
    fn close(&mut self, name: &str) -> Result<(), CsiError> {
        if !self.open_mappings.contains(name) {
            return Ok(());
        }
        if self.fail_closes > 0 {
            self.fail_closes -= 1;
            return Err(CsiError::Encryption(format!(
                "cryptsetup close {name}: device busy"
            )));
        }
        self.open_mappings.remove(name);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeMounter {
    state: Mutex<State>,
}

impl FakeMounter {
    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with_state(|s| s.calls.clone())
    }

    fn calls_matching(&self, pred: impl Fn(&Call) -> bool) -> Vec<Call> {
        self.calls().into_iter().filter(|c| pred(c)).collect()
    }

    /// `(source, fs_type)` of every format call.
    pub fn formats(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Format {
                    source, fs_type, ..
                } => Some((source, fs_type)),
                _ => None,
            })
            .collect()
    }

    pub fn mounts(&self) -> Vec<Call> {
        self.calls_matching(|c| matches!(c, Call::Mount { .. }))
    }

    pub fn unmounts(&self) -> Vec<Call> {
        self.calls_matching(|c| matches!(c, Call::Unmount { .. }))
    }

    pub fn resizes(&self) -> Vec<Call> {
        self.calls_matching(|c| matches!(c, Call::Resize { .. }))
    }

    pub fn set_formatted(&self, device: &str) {
        self.with_state(|s| s.formatted.insert(device.to_owned()));
    }

    pub fn fail_mounts(&self, fail: bool) {
        self.with_state(|s| s.fail_mounts = fail);
    }

    pub fn fail_resizes(&self, fail: bool) {
        self.with_state(|s| s.fail_resizes = fail);
    }

    pub fn fail_closes(&self, count: usize) {
        self.with_state(|s| s.fail_closes = count);
    }

    pub fn is_mapping_open(&self, name: &str) -> bool {
        self.with_state(|s| s.open_mappings.contains(name))
    }

    pub fn is_mounted_now(&self, target: &str) -> bool {
        self.with_state(|s| s.mounts.contains_key(target))
    }

    pub fn source_of(&self, target: &str) -> Option<String> {
        self.with_state(|s| s.mounts.get(target).cloned())
    }
}

impl Mounter for FakeMounter {
    fn is_formatted(&self, source: &str, _luks: &LuksContext) -> Result<bool, CsiError> {
        self.with_state(|s| {
            s.calls.push(Call::IsFormatted {
                source: source.to_owned(),
            });
            Ok(s.formatted.contains(source))
        })
    }

    fn format(&self, source: &str, fs_type: &str, luks: &LuksContext) -> Result<(), CsiError> {
        self.with_state(|s| {
            s.calls.push(Call::Format {
                source: source.to_owned(),
                fs_type: fs_type.to_owned(),
                encrypted: luks.device_transform().is_some(),
            });
            if let Some(params) = luks.device_transform() {
                s.open_mappings.insert(params.mapping_name().to_owned());
            }
            s.formatted.insert(source.to_owned());
            Ok(())
        })
    }

    fn is_mounted(&self, target: &str) -> Result<bool, CsiError> {
        self.with_state(|s| {
            s.calls.push(Call::IsMounted {
                target: target.to_owned(),
            });
            Ok(s.mounts.contains_key(target))
        })
    }

    fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        luks: &LuksContext,
        options: &[String],
    ) -> Result<(), CsiError> {
        self.with_state(|s| {
            s.calls.push(Call::Mount {
                source: source.to_owned(),
                target: target.to_owned(),
                fs_type: fs_type.to_owned(),
                options: options.to_vec(),
                encrypted: luks.encryption_enabled(),
            });
            if s.fail_mounts {
                return Err(CsiError::MountFailed {
                    path: target.to_owned(),
                    reason: "injected failure".to_owned(),
                });
            }
            s.mounts.insert(target.to_owned(), source.to_owned());
            if let Some(params) = luks.device_transform() {
                let name = params.mapping_name().to_owned();
                s.open_mappings.insert(name.clone());
                s.mapped_mounts.insert(target.to_owned(), name);
            }
            Ok(())
        })
    }

    fn unmount(&self, target: &str, luks: &LuksContext) -> Result<(), CsiError> {
        self.with_state(|s| {
            s.calls.push(Call::Unmount {
                target: target.to_owned(),
                lifecycle: luks.lifecycle(),
            });
            s.mounts.remove(target);
            match s.mapped_mounts.remove(target) {
                Some(name) if luks.closes_mapping() => s.close(&name),
                _ => Ok(()),
            }
        })
    }

    fn close_mapping(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        self.with_state(|s| {
            s.calls.push(Call::CloseMapping {
                volume_id: volume_id.to_string(),
            });
            s.close(&mapping_name(volume_id))
        })
    }

    fn device_for_mount(&self, target: &str) -> Result<String, CsiError> {
        self.with_state(|s| {
            s.calls.push(Call::DeviceForMount {
                target: target.to_owned(),
            });
            s.mounts
                .get(target)
                .cloned()
                .ok_or_else(|| CsiError::Internal(format!("no mount found at {target}")))
        })
    }

    fn resize(&self, device: &str, target: &str) -> Result<(), CsiError> {
        self.with_state(|s| {
            s.calls.push(Call::Resize {
                device: device.to_owned(),
                target: target.to_owned(),
            });
            if s.fail_resizes {
                return Err(CsiError::ResizeFailed {
                    path: target.to_owned(),
                    reason: "injected failure".to_owned(),
                });
            }
            Ok(())
        })
    }
}

/// Resolver that answers every lookup with one device, or with none.
#[derive(Debug)]
pub struct FakeResolver {
    device: String,
    missing: Mutex<bool>,
    serials: Mutex<Vec<String>>,
}

impl FakeResolver {
    pub fn new(device: &str) -> Self {
        Self {
            device: device.to_owned(),
            missing: Mutex::new(false),
            serials: Mutex::new(Vec::new()),
        }
    }

    pub fn set_missing(&self) {
        *self.missing.lock().unwrap() = true;
    }

    /// Serials looked up so far.
    pub fn serials(&self) -> Vec<String> {
        self.serials.lock().unwrap().clone()
    }
}

impl DeviceResolver for FakeResolver {
    fn find_device(&self, volume_id: &VolumeId, serial: &str) -> Result<String, CsiError> {
        self.serials.lock().unwrap().push(serial.to_owned());
        if *self.missing.lock().unwrap() {
            return Err(CsiError::DeviceNotFound {
                volume_id: volume_id.to_string(),
                serial: serial.to_owned(),
                reason: "not attached".to_owned(),
            });
        }
        Ok(self.device.clone())
    }
}
