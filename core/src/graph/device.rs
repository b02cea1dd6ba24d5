//! Device specifiers.
//!
//! A device string names where an operation runs, e.g. `/job:ps/replica:0/task:1/device:CPU:0`.
//! Every field is optional, so a specifier can be partial (`/device:CPU:0`, `/job:worker/task:3`).
//! The legacy short form `/cpu:0` is accepted on input and normalized on output.
//!
//! ```rust
//! use ps_sync::graph::DeviceSpec;
//!
//! let ps = DeviceSpec::parse("/job:ps/task:0/device:CPU:0").unwrap();
//! let moved = ps.with_task(3);
//! assert_eq!(moved.to_string(), "/job:ps/task:3/device:CPU:0");
//! ```

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured device identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub job: Option<String>,
    pub replica: Option<u32>,
    pub task: Option<u32>,
    pub device_type: Option<String>,
    pub device_index: Option<u32>,
}

impl DeviceSpec {
    /// Parses a device string. The empty string yields an empty specifier.
    pub fn parse(device: &str) -> Result<Self> {
        let mut spec = DeviceSpec::default();
        for part in device.split('/').filter(|p| !p.is_empty()) {
            let fields: Vec<&str> = part.split(':').collect();
            match fields.as_slice() {
                ["job", job] => spec.job = Some((*job).to_string()),
                ["replica", r] => spec.replica = Some(parse_number(device, r)?),
                ["task", t] => spec.task = Some(parse_number(device, t)?),
                ["device", ty] => spec.device_type = Some(ty.to_uppercase()),
                ["device", ty, "*"] => spec.device_type = Some(ty.to_uppercase()),
                ["device", ty, idx] => {
                    spec.device_type = Some(ty.to_uppercase());
                    spec.device_index = Some(parse_number(device, idx)?);
                }
                // legacy `/cpu:0`, `/gpu:1`
                [ty, idx] if ty.eq_ignore_ascii_case("cpu") || ty.eq_ignore_ascii_case("gpu") => {
                    spec.device_type = Some(ty.to_uppercase());
                    if *idx != "*" {
                        spec.device_index = Some(parse_number(device, idx)?);
                    }
                }
                _ => {
                    return Err(SyncError::InvalidDevice {
                        device: device.to_string(),
                        reason: format!("unrecognized component `{part}`"),
                    });
                }
            }
        }
        Ok(spec)
    }

    /// Field-wise override: every field set in `other` replaces the field in `self`.
    pub fn replace(&self, other: &DeviceSpec) -> DeviceSpec {
        DeviceSpec {
            job: other.job.clone().or_else(|| self.job.clone()),
            replica: other.replica.or(self.replica),
            task: other.task.or(self.task),
            device_type: other.device_type.clone().or_else(|| self.device_type.clone()),
            device_index: other.device_index.or(self.device_index),
        }
    }

    pub fn with_task(&self, task: u32) -> DeviceSpec {
        self.replace(&DeviceSpec {
            task: Some(task),
            ..Default::default()
        })
    }

    pub fn with_device(&self, device_type: &str, device_index: u32) -> DeviceSpec {
        self.replace(&DeviceSpec {
            device_type: Some(device_type.to_uppercase()),
            device_index: Some(device_index),
            ..Default::default()
        })
    }

    /// Keeps only the job, replica and task fields.
    pub fn host(&self) -> DeviceSpec {
        DeviceSpec {
            job: self.job.clone(),
            replica: self.replica,
            task: self.task,
            device_type: None,
            device_index: None,
        }
    }

    /// Task id, treating a missing task as task 0.
    pub fn task_or_default(&self) -> u32 {
        self.task.unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        *self == DeviceSpec::default()
    }
}

fn parse_number(device: &str, field: &str) -> Result<u32> {
    field.parse().map_err(|_| SyncError::InvalidDevice {
        device: device.to_string(),
        reason: format!("`{field}` is not a number"),
    })
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(job) = &self.job {
            write!(f, "/job:{job}")?;
        }
        if let Some(replica) = self.replica {
            write!(f, "/replica:{replica}")?;
        }
        if let Some(task) = self.task {
            write!(f, "/task:{task}")?;
        }
        if let Some(ty) = &self.device_type {
            match self.device_index {
                Some(idx) => write!(f, "/device:{ty}:{idx}")?,
                None => write!(f, "/device:{ty}:*")?,
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for DeviceSpec {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        DeviceSpec::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let spec = DeviceSpec::parse("/job:ps/replica:0/task:2/device:CPU:0").unwrap();
        assert_eq!(spec.job.as_deref(), Some("ps"));
        assert_eq!(spec.replica, Some(0));
        assert_eq!(spec.task, Some(2));
        assert_eq!(spec.device_type.as_deref(), Some("CPU"));
        assert_eq!(spec.device_index, Some(0));
        assert_eq!(spec.to_string(), "/job:ps/replica:0/task:2/device:CPU:0");
    }

    #[test]
    fn test_parse_partial_and_legacy() {
        let spec = DeviceSpec::parse("/cpu:0").unwrap();
        assert_eq!(spec.to_string(), "/device:CPU:0");

        let spec = DeviceSpec::parse("/job:worker/task:1").unwrap();
        assert_eq!(spec.task_or_default(), 1);
        assert!(spec.device_type.is_none());

        assert!(DeviceSpec::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            DeviceSpec::parse("/job:ps/task:x"),
            Err(SyncError::InvalidDevice { .. })
        ));
        assert!(DeviceSpec::parse("/bogus").is_err());
    }

    #[test]
    fn test_replace_preserves_other_fields() {
        let ps = DeviceSpec::parse("/job:ps/replica:0/task:0/device:CPU:0").unwrap();
        let moved = ps.with_task(5);
        assert_eq!(moved.to_string(), "/job:ps/replica:0/task:5/device:CPU:0");

        let worker = DeviceSpec::parse("/job:worker/task:1/device:GPU:0").unwrap();
        assert_eq!(
            worker.with_device("cpu", 0).to_string(),
            "/job:worker/task:1/device:CPU:0"
        );
        assert_eq!(worker.host().to_string(), "/job:worker/task:1");
    }
}
