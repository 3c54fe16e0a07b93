//! User and group name resolution for supervised processes

use crate::config::ConfigError;

/// Resolve a user name (or numeric uid) to a uid
pub fn resolve_user(name: &str) -> Result<u32, ConfigError> {
    if let Ok(uid) = name.parse::<u32>() {
        return Ok(uid);
    }
    lookup_user(name).ok_or_else(|| ConfigError::UnknownIdentity {
        kind: "user",
        name: name.to_string(),
    })
}

/// Resolve a group name (or numeric gid) to a gid
pub fn resolve_group(name: &str) -> Result<u32, ConfigError> {
    if let Ok(gid) = name.parse::<u32>() {
        return Ok(gid);
    }
    lookup_group(name).ok_or_else(|| ConfigError::UnknownIdentity {
        kind: "group",
        name: name.to_string(),
    })
}

#[cfg(unix)]
fn lookup_user(name: &str) -> Option<u32> {
    let cname = std::ffi::CString::new(name).ok()?;
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0 as libc::c_char; 16 * 1024];
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    let rc = unsafe {
        libc::getpwnam_r(
            cname.as_ptr(),
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };

    if rc != 0 || result.is_null() {
        return None;
    }
    Some(pwd.pw_uid)
}

#[cfg(unix)]
fn lookup_group(name: &str) -> Option<u32> {
    let cname = std::ffi::CString::new(name).ok()?;
    let mut grp: libc::group = unsafe { std::mem::zeroed() };
    let mut buf = vec![0 as libc::c_char; 16 * 1024];
    let mut result: *mut libc::group = std::ptr::null_mut();

    let rc = unsafe {
        libc::getgrnam_r(
            cname.as_ptr(),
            &mut grp,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };

    if rc != 0 || result.is_null() {
        return None;
    }
    Some(grp.gr_gid)
}

#[cfg(not(unix))]
fn lookup_user(_name: &str) -> Option<u32> {
    None
}

#[cfg(not(unix))]
fn lookup_group(_name: &str) -> Option<u32> {
    None
}
