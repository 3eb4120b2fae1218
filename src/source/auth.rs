//! Camera access authorization.
//!
//! Authorization is a precondition gate resolved once per source: authorized
//! proceeds, not-yet-determined asks exactly once, denied or restricted never
//! starts. There is no retry loop.

use crate::error::SetupError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Authorized,
    NotDetermined,
    Denied,
    Restricted,
}

pub trait Authorizer: Send {
    /// Current status. Errors when the device itself is missing.
    fn status(&self) -> Result<AuthorizationStatus, SetupError>;

    /// Ask for access. Only called when `status` is `NotDetermined`.
    fn request_access(&mut self) -> bool;
}

/// Fixed answer, for synthetic devices and tests.
#[derive(Clone, Debug)]
pub struct StaticAuthorizer {
    status: AuthorizationStatus,
    grant: bool,
}

impl StaticAuthorizer {
    pub fn new(status: AuthorizationStatus) -> Self {
        Self {
            status,
            grant: false,
        }
    }

    pub fn authorized() -> Self {
        Self::new(AuthorizationStatus::Authorized)
    }

    pub fn denied() -> Self {
        Self::new(AuthorizationStatus::Denied)
    }

    /// Not yet determined; the single request is answered with `grant`.
    pub fn undetermined(grant: bool) -> Self {
        Self {
            status: AuthorizationStatus::NotDetermined,
            grant,
        }
    }
}

impl Authorizer for StaticAuthorizer {
    fn status(&self) -> Result<AuthorizationStatus, SetupError> {
        Ok(self.status)
    }

    fn request_access(&mut self) -> bool {
        self.status = if self.grant {
            AuthorizationStatus::Authorized
        } else {
            AuthorizationStatus::Denied
        };
        self.grant
    }
}

/// Linux device-node permissions: read/write access to e.g. `/dev/video0`.
#[cfg(target_os = "linux")]
#[derive(Clone, Debug)]
pub struct DeviceNodeAuthorizer {
    path: String,
}

#[cfg(target_os = "linux")]
impl DeviceNodeAuthorizer {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[cfg(target_os = "linux")]
impl Authorizer for DeviceNodeAuthorizer {
    fn status(&self) -> Result<AuthorizationStatus, SetupError> {
        let c_path = std::ffi::CString::new(self.path.as_str()).map_err(|_| {
            SetupError::NoCaptureDevice(format!("invalid device path {:?}", self.path))
        })?;
        // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
        let rc = unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::W_OK) };
        if rc == 0 {
            return Ok(AuthorizationStatus::Authorized);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENOENT) | Some(libc::ENOTDIR) => {
                Err(SetupError::NoCaptureDevice(self.path.clone()))
            }
            Some(libc::EACCES) | Some(libc::EPERM) => Ok(AuthorizationStatus::Denied),
            _ => {
                log::warn!("access check on {} failed: {}", self.path, err);
                Ok(AuthorizationStatus::Restricted)
            }
        }
    }

    fn request_access(&mut self) -> bool {
        // Device nodes never report NotDetermined.
        false
    }
}

/// Resolve the gate: `Ok(())` when capture may start.
pub(crate) fn resolve(authorizer: &mut dyn Authorizer) -> Result<(), SetupError> {
    match authorizer.status()? {
        AuthorizationStatus::Authorized => Ok(()),
        AuthorizationStatus::NotDetermined => {
            if authorizer.request_access() {
                log::info!("camera access granted");
                Ok(())
            } else {
                Err(SetupError::AccessDenied(AuthorizationStatus::Denied))
            }
        }
        status @ (AuthorizationStatus::Denied | AuthorizationStatus::Restricted) => {
            Err(SetupError::AccessDenied(status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorized_proceeds() {
        assert!(resolve(&mut StaticAuthorizer::authorized()).is_ok());
    }

    #[test]
    fn undetermined_follows_the_answer() {
        assert!(resolve(&mut StaticAuthorizer::undetermined(true)).is_ok());
        assert!(matches!(
            resolve(&mut StaticAuthorizer::undetermined(false)),
            Err(SetupError::AccessDenied(AuthorizationStatus::Denied))
        ));
    }

    #[test]
    fn restricted_never_starts() {
        assert!(matches!(
            resolve(&mut StaticAuthorizer::new(AuthorizationStatus::Restricted)),
            Err(SetupError::AccessDenied(AuthorizationStatus::Restricted))
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn missing_device_node_is_reported() {
        let auth = DeviceNodeAuthorizer::new("/dev/does-not-exist-video99");
        assert!(matches!(auth.status(), Err(SetupError::NoCaptureDevice(_))));
    }
}
