//! Session identity: who the audit log is about.

use std::ffi::CStr;

use nix::errno::Errno;
use nix::libc;

/// Prefix of the syslog identifier when none is configured.
pub const DEFAULT_IDENT_PREFIX: &str = "rt-ses";

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("error resolving username: {0}")]
    NoLogin(#[source] Errno),

    #[error("login name is not valid UTF-8")]
    InvalidLogin,
}

/// The login name of the user on this process's controlling terminal.
pub fn login_name() -> Result<String, IdentityError> {
    Errno::clear();
    // SAFETY: getlogin returns NULL or a pointer to static storage, which is
    // copied out before any other libc call could overwrite it.
    let ptr = unsafe { libc::getlogin() };
    if ptr.is_null() {
        // getlogin may fail without setting errno when there is no utmp entry.
        let errno = match Errno::last() {
            Errno::UnknownErrno => Errno::ENXIO,
            e => e,
        };
        return Err(IdentityError::NoLogin(errno));
    }

    // SAFETY: non-NULL result is a NUL-terminated string.
    let name = unsafe { CStr::from_ptr(ptr) };
    let name = name.to_str().map_err(|_| IdentityError::InvalidLogin)?;
    if name.is_empty() {
        return Err(IdentityError::NoLogin(Errno::ENXIO));
    }
    Ok(name.to_owned())
}

/// Syslog identifier for the current user's session, e.g. `rt-ses-alice`.
pub fn session_ident(prefix: &str) -> Result<String, IdentityError> {
    let login = login_name()?;
    Ok(format_ident(prefix, &login))
}

fn format_ident(prefix: &str, login: &str) -> String {
    format!("{prefix}-{login}")
}
