//! Pre-fork preparation: user switching, chroot and working directory plan

use crate::error::{SpawnError, SpawnErrorKind};
use crate::options::Options;
use std::ffi::CString;
use std::path::{Path, PathBuf};

/// Everything computed before forking that the child applies after it:
/// the identity to drop to, the jail to enter, and the working-directory
/// chain used for the readable-parents diagnostic.
#[derive(Debug, Clone)]
pub(crate) struct SpawnPreparation {
    pub app_root: PathBuf,
    pub chroot_dir: PathBuf,
    pub app_root_inside_chroot: PathBuf,
    pub switch_user: bool,
    pub username: String,
    pub groupname: String,
    pub home: String,
    pub shell: String,
    pub uid: u32,
    pub gid: u32,
    pub gidset: Vec<u32>,
    /// Every ancestor of the app root inside the chroot, shallowest first
    pub app_root_paths_inside_chroot: Vec<PathBuf>,
}

struct UserEntry {
    name: String,
    uid: u32,
    gid: u32,
    home: String,
    shell: String,
}

struct GroupEntry {
    name: String,
    gid: u32,
}

fn internal_error(message: String) -> SpawnError {
    SpawnError::new(SpawnErrorKind::InternalError, message)
}

fn lookup_user_by_name(name: &str) -> Option<UserEntry> {
    let cname = CString::new(name).ok()?;
    let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
    user_entry_from(pw)
}

fn lookup_user_by_uid(uid: u32) -> Option<UserEntry> {
    let pw = unsafe { libc::getpwuid(uid) };
    user_entry_from(pw)
}

fn user_entry_from(pw: *mut libc::passwd) -> Option<UserEntry> {
    if pw.is_null() {
        return None;
    }
    unsafe {
        Some(UserEntry {
            name: cstr_to_string((*pw).pw_name),
            uid: (*pw).pw_uid,
            gid: (*pw).pw_gid,
            home: cstr_to_string((*pw).pw_dir),
            shell: cstr_to_string((*pw).pw_shell),
        })
    }
}

fn lookup_group_by_name(name: &str) -> Option<GroupEntry> {
    let cname = CString::new(name).ok()?;
    let gr = unsafe { libc::getgrnam(cname.as_ptr()) };
    group_entry_from(gr)
}

fn lookup_group_by_gid(gid: u32) -> Option<GroupEntry> {
    let gr = unsafe { libc::getgrgid(gid) };
    group_entry_from(gr)
}

fn group_entry_from(gr: *mut libc::group) -> Option<GroupEntry> {
    if gr.is_null() {
        return None;
    }
    unsafe {
        Some(GroupEntry {
            name: cstr_to_string((*gr).gr_name),
            gid: (*gr).gr_gid,
        })
    }
}

unsafe fn cstr_to_string(ptr: *const libc::c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

fn supplementary_groups(username: &str, gid: u32) -> Vec<u32> {
    let cname = match CString::new(username) {
        Ok(c) => c,
        Err(_) => return vec![gid],
    };
    let mut count: libc::c_int = 64;
    loop {
        #[cfg(target_os = "macos")]
        let mut groups = vec![0 as libc::c_int; count as usize];
        #[cfg(not(target_os = "macos"))]
        let mut groups = vec![0 as libc::gid_t; count as usize];
        let ret = unsafe {
            libc::getgrouplist(
                cname.as_ptr(),
                gid as _,
                groups.as_mut_ptr(),
                &mut count as *mut libc::c_int,
            )
        };
        if ret >= 0 {
            groups.truncate(count.max(0) as usize);
            return groups.into_iter().map(|g| g as u32).collect();
        }
        if count as usize <= groups.len() {
            // Defensive: getgrouplist asked for fewer slots than we gave it
            return vec![gid];
        }
    }
}

fn file_uid(path: &Path) -> Option<u32> {
    use std::os::unix::fs::MetadataExt;
    std::fs::symlink_metadata(path).ok().map(|m| m.uid())
}

fn file_gid(path: &Path) -> Option<u32> {
    use std::os::unix::fs::MetadataExt;
    std::fs::symlink_metadata(path).ok().map(|m| m.gid())
}

/// Compute the chroot layout: where the jail is and what the app root
/// looks like from inside it
fn prepare_chroot(prep: &mut SpawnPreparation, options: &Options) -> Result<(), SpawnError> {
    prep.app_root = PathBuf::from(&options.app_root);
    prep.chroot_dir = options
        .preexec_chroot
        .clone()
        .unwrap_or_else(|| PathBuf::from("/"));
    if prep.chroot_dir != Path::new("/") && !prep.app_root.starts_with(&prep.chroot_dir) {
        return Err(internal_error(format!(
            "Invalid configuration: '{}' has been configured as the chroot jail, \
             but the application root '{}' is not located inside it",
            prep.chroot_dir.display(),
            prep.app_root.display()
        )));
    }
    prep.app_root_inside_chroot = if prep.chroot_dir == Path::new("/") {
        prep.app_root.clone()
    } else if prep.app_root == prep.chroot_dir {
        PathBuf::from("/")
    } else {
        Path::new("/").join(
            prep.app_root
                .strip_prefix(&prep.chroot_dir)
                .expect("app root is inside the chroot"),
        )
    };
    Ok(())
}

/// Resolve the user and group the worker will run as. Only effective when
/// we are root; otherwise the worker inherits our own identity.
fn prepare_user_switching(prep: &mut SpawnPreparation, options: &Options) -> Result<(), SpawnError> {
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        let user = lookup_user_by_uid(euid).ok_or_else(|| {
            internal_error(format!(
                "Cannot get user database entry for UID {}; your system's user \
                 database looks broken",
                euid
            ))
        })?;
        let group = lookup_group_by_gid(user.gid).ok_or_else(|| {
            internal_error(format!(
                "Cannot get group database entry for GID {}; your system's user \
                 database looks broken",
                user.gid
            ))
        })?;
        prep.switch_user = false;
        prep.username = user.name;
        prep.groupname = group.name;
        prep.home = user.home;
        prep.shell = user.shell;
        prep.uid = euid;
        prep.gid = user.gid;
        prep.gidset = Vec::new();
        return Ok(());
    }

    let startup_file = options
        .startup_file()
        .map(|f| prep.app_root.join(f))
        .unwrap_or_else(|| prep.app_root.clone());

    let mut user = match &options.user {
        Some(name) => lookup_user_by_name(name),
        None => file_uid(&startup_file).and_then(lookup_user_by_uid),
    };
    if user.as_ref().map(|u| u.uid == 0).unwrap_or(true) {
        user = lookup_user_by_name(&options.default_user);
    }
    let user = user.ok_or_else(|| {
        internal_error("Cannot determine a user to lower privilege to".to_string())
    })?;

    let mut group = match options.group.as_deref() {
        Some("!STARTUP_FILE!") => file_gid(&startup_file).and_then(lookup_group_by_gid),
        Some(name) => lookup_group_by_name(name),
        None => lookup_group_by_gid(user.gid),
    };
    if group.as_ref().map(|g| g.gid == 0).unwrap_or(true) {
        group = match &options.default_group {
            Some(name) => lookup_group_by_name(name),
            None => lookup_group_by_gid(user.gid),
        };
    }
    let group = group.ok_or_else(|| {
        internal_error("Cannot determine a group to lower privilege to".to_string())
    })?;

    prep.switch_user = true;
    prep.gidset = supplementary_groups(&user.name, group.gid);
    prep.username = user.name;
    prep.groupname = group.name;
    prep.home = user.home;
    prep.shell = user.shell;
    prep.uid = user.uid;
    prep.gid = group.gid;
    Ok(())
}

/// Record every ancestor of the app root as seen from inside the chroot,
/// for the readable-parents diagnostic
fn prepare_working_directory(prep: &mut SpawnPreparation) {
    let mut chain = Vec::new();
    let mut current = PathBuf::from("/");
    for component in prep.app_root_inside_chroot.components() {
        use std::path::Component;
        if let Component::Normal(part) = component {
            current = current.join(part);
            chain.push(current.clone());
        }
    }
    if chain.is_empty() {
        chain.push(PathBuf::from("/"));
    }
    prep.app_root_paths_inside_chroot = chain;
}

/// Compute the full pre-exec plan for the given options
pub(crate) fn prepare_spawn(options: &Options) -> Result<SpawnPreparation, SpawnError> {
    let mut prep = SpawnPreparation {
        app_root: PathBuf::new(),
        chroot_dir: PathBuf::new(),
        app_root_inside_chroot: PathBuf::new(),
        switch_user: false,
        username: String::new(),
        groupname: String::new(),
        home: String::new(),
        shell: String::new(),
        uid: 0,
        gid: 0,
        gidset: Vec::new(),
        app_root_paths_inside_chroot: Vec::new(),
    };
    prepare_chroot(&mut prep, options)?;
    prepare_user_switching(&mut prep, options)?;
    prepare_working_directory(&mut prep);
    Ok(prep)
}

/// Pre-flight check that the planned worker identity can actually reach
/// its working directory; produces the permission diagnostic the child
/// would otherwise die with
pub(crate) fn check_directory_chain(prep: &SpawnPreparation) -> Result<(), SpawnError> {
    // Outside a chroot the chain can be statted directly; inside one we
    // can only check up to the jail boundary from here
    if prep.chroot_dir != Path::new("/") {
        return Ok(());
    }
    for path in &prep.app_root_paths_inside_chroot {
        if let Err(e) = std::fs::metadata(path) {
            let parent = path
                .parent()
                .unwrap_or_else(|| Path::new("/"))
                .to_path_buf();
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                return Err(internal_error(format!(
                    "This application process is being run as user '{}' and group \
                     '{}' and must be able to access its application root directory \
                     '{}'. However, the parent directory '{}' has wrong permissions. \
                     Please fix the permissions of '{}' first.",
                    prep.username,
                    prep.groupname,
                    prep.app_root.display(),
                    parent.display(),
                    parent.display()
                )));
            } else {
                return Err(internal_error(format!(
                    "Unable to stat() directory '{}': {}",
                    path.display(),
                    e
                )));
            }
        }
    }
    Ok(())
}

/// Apply the plan inside the forked child, before exec:
/// setgroups -> setgid -> setuid -> chroot -> chdir.
///
/// Runs in the post-fork pre-exec window, so only async-signal-safe
/// libc calls are allowed here.
pub(crate) fn apply_in_child(prep: &SpawnPreparation) -> std::io::Result<()> {
    unsafe {
        if prep.switch_user {
            if !prep.gidset.is_empty() {
                #[cfg(target_os = "macos")]
                let gidset: Vec<libc::c_int> =
                    prep.gidset.iter().map(|g| *g as libc::c_int).collect();
                #[cfg(not(target_os = "macos"))]
                let gidset: Vec<libc::gid_t> =
                    prep.gidset.iter().map(|g| *g as libc::gid_t).collect();
                if libc::setgroups(gidset.len() as _, gidset.as_ptr() as *const _) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            if libc::setgid(prep.gid as libc::gid_t) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::setuid(prep.uid as libc::uid_t) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        if prep.chroot_dir != Path::new("/") {
            let dir = CString::new(prep.chroot_dir.as_os_str().as_encoded_bytes())
                .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
            if libc::chroot(dir.as_ptr()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        let cwd = CString::new(prep.app_root_inside_chroot.as_os_str().as_encoded_bytes())
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
        if libc::chdir(cwd.as_ptr()) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_without_chroot() {
        let options = Options::for_app_root("/srv/app");
        let prep = prepare_spawn(&options).unwrap();
        assert_eq!(prep.chroot_dir, PathBuf::from("/"));
        assert_eq!(prep.app_root_inside_chroot, PathBuf::from("/srv/app"));
        assert_eq!(
            prep.app_root_paths_inside_chroot,
            vec![PathBuf::from("/srv"), PathBuf::from("/srv/app")]
        );
    }

    #[test]
    fn test_prepare_with_chroot() {
        let mut options = Options::for_app_root("/jail/srv/app");
        options.preexec_chroot = Some(PathBuf::from("/jail"));
        let prep = prepare_spawn(&options).unwrap();
        assert_eq!(prep.app_root_inside_chroot, PathBuf::from("/srv/app"));
    }

    #[test]
    fn test_app_root_equals_chroot() {
        let mut options = Options::for_app_root("/jail");
        options.preexec_chroot = Some(PathBuf::from("/jail"));
        let prep = prepare_spawn(&options).unwrap();
        assert_eq!(prep.app_root_inside_chroot, PathBuf::from("/"));
        assert_eq!(
            prep.app_root_paths_inside_chroot,
            vec![PathBuf::from("/")]
        );
    }

    #[test]
    fn test_app_root_outside_chroot_is_rejected() {
        let mut options = Options::for_app_root("/srv/app");
        options.preexec_chroot = Some(PathBuf::from("/jail"));
        let err = prepare_spawn(&options).unwrap_err();
        assert_eq!(err.kind, SpawnErrorKind::InternalError);
        assert!(err.message.contains("chroot"));
    }

    #[test]
    fn test_non_root_keeps_own_identity() {
        // The test suite never runs as root
        if unsafe { libc::geteuid() } == 0 {
            return;
        }
        let options = Options::for_app_root("/srv/app");
        let prep = prepare_spawn(&options).unwrap();
        assert!(!prep.switch_user);
        assert_eq!(prep.uid, unsafe { libc::geteuid() });
        assert!(!prep.username.is_empty());
    }

    #[test]
    fn test_check_directory_chain_on_real_dir() {
        let dir = tempfile::tempdir().unwrap();
        let app_root = dir.path().join("app");
        std::fs::create_dir(&app_root).unwrap();
        let options = Options::for_app_root(app_root.to_string_lossy());
        let prep = prepare_spawn(&options).unwrap();
        assert!(check_directory_chain(&prep).is_ok());
    }

    #[test]
    fn test_check_directory_chain_missing_dir() {
        let options = Options::for_app_root("/nonexistent-spawnpool-test/app");
        let prep = prepare_spawn(&options).unwrap();
        let err = check_directory_chain(&prep).unwrap_err();
        assert!(err.message.contains("stat"));
    }
}
