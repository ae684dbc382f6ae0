//! Locating the target's `call_stack`/`g_frame_stack` globals and the Zeek
//! version string, from nothing but its pid.
//!
//! This mirrors what a debugger does before it can make sense of symbols:
//! find the running binary, find where it's mapped, and look its dynamic
//! symbol table up for the globals we need.

use std::fs;
use std::path::{Path, PathBuf};

use object::{Object, ObjectSymbol};

use crate::core::memory::MemorySource;
use crate::core::types::IntrospectionError;

const SYM_CALL_STACK: &str = "call_stack";
const SYM_FRAME_STACK: &str = "g_frame_stack";
const SYM_VERSION: &str = "version";

/// Everything the rest of the profiler needs to know about the target
/// process's Zeek image: where its tracked globals live in the tracee's
/// address space. `version_addr` points at a NUL-terminated version string
/// in the target's own data segment; reading it requires an attached
/// `MemorySource`, so resolving it is a separate step from locating it.
#[derive(Debug, Clone)]
pub struct ZeekImage {
    pub exe: PathBuf,
    pub load_addr: u64,
    pub call_stack_addr: u64,
    pub frame_stack_addr: u64,
    pub version_addr: u64,
}

impl ZeekImage {
    /// Reads the dotted version string (e.g. `"3.1.2"`) out of the attached
    /// target. Must be called after the process is ptrace-stopped.
    pub fn read_version(&self, mem: &dyn MemorySource) -> Result<String, IntrospectionError> {
        mem.read_cstring(self.version_addr)
    }
}

/// Resolves the target's image by reading `/proc/<pid>/exe`, `/proc/<pid>/maps`,
/// and the binary's own dynamic symbol table. Does not require the process to
/// be ptrace-attached — it only reads `/proc` and the ELF file itself.
pub fn resolve(pid: libc::pid_t) -> Result<ZeekImage, IntrospectionError> {
    let exe_link = format!("/proc/{}/exe", pid);
    let exe = fs::read_link(&exe_link).map_err(|e| {
        IntrospectionError::ImageResolutionFailed(pid, format!("readlink {}: {}", exe_link, e))
    })?;

    // Namespaced processes may have their exe's contents only visible
    // through the /proc/<pid>/root mount-namespace shim.
    let open_path = resolve_in_namespace(pid, &exe);
    let data = fs::read(&open_path).map_err(|e| {
        IntrospectionError::ImageResolutionFailed(pid, format!("reading {:?}: {}", open_path, e))
    })?;
    let file = object::File::parse(&*data).map_err(|e| {
        IntrospectionError::ImageResolutionFailed(pid, format!("parsing ELF {:?}: {}", open_path, e))
    })?;

    let mut call_stack_addr = None;
    let mut frame_stack_addr = None;
    let mut version_addr = None;
    for symbol in file.dynamic_symbols() {
        let name = match symbol.name() {
            Ok(name) => name,
            Err(_) => continue,
        };
        match name {
            SYM_CALL_STACK => call_stack_addr = Some(symbol.address()),
            SYM_FRAME_STACK => frame_stack_addr = Some(symbol.address()),
            SYM_VERSION => version_addr = Some(symbol.address()),
            _ => {}
        }
    }

    let call_stack_sym = call_stack_addr.ok_or(IntrospectionError::MissingSymbol(SYM_CALL_STACK))?;
    let frame_stack_sym = frame_stack_addr.ok_or(IntrospectionError::MissingSymbol(SYM_FRAME_STACK))?;
    let version_sym = version_addr.ok_or(IntrospectionError::MissingSymbol(SYM_VERSION))?;

    let load_addr = find_load_addr(pid, &exe)?;

    Ok(ZeekImage {
        exe,
        load_addr,
        call_stack_addr: load_addr + call_stack_sym,
        frame_stack_addr: load_addr + frame_stack_sym,
        version_addr: load_addr + version_sym,
    })
}

fn resolve_in_namespace(pid: libc::pid_t, exe: &Path) -> PathBuf {
    let root = format!("/proc/{}/root", pid);
    let candidate = Path::new(&root).join(exe.strip_prefix("/").unwrap_or(exe));
    if candidate.exists() {
        candidate
    } else {
        exe.to_path_buf()
    }
}

/// Parses `/proc/<pid>/maps`, returning the lowest start address among
/// mappings whose path matches `exe`. PIE binaries load at a kernel-chosen
/// base; every symbol address from the ELF file must be offset by this.
fn find_load_addr(pid: libc::pid_t, exe: &Path) -> Result<u64, IntrospectionError> {
    let maps_path = format!("/proc/{}/maps", pid);
    let contents = fs::read_to_string(&maps_path).map_err(|e| {
        IntrospectionError::ImageResolutionFailed(pid, format!("reading {}: {}", maps_path, e))
    })?;

    let exe_str = exe.to_string_lossy();
    let mut lowest: Option<u64> = None;
    for line in contents.lines() {
        if !line.contains(exe_str.as_ref()) {
            continue;
        }
        let range = match line.split_whitespace().next() {
            Some(r) => r,
            None => continue,
        };
        let start_hex = match range.split('-').next() {
            Some(s) => s,
            None => continue,
        };
        if let Ok(start) = u64::from_str_radix(start_hex, 16) {
            lowest = Some(match lowest {
                Some(current) if current <= start => current,
                _ => start,
            });
        }
    }

    lowest.ok_or_else(|| {
        IntrospectionError::ImageResolutionFailed(
            pid,
            format!("no mapping found for {:?} in {}", exe, maps_path),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn resolve_fails_for_process_without_zeek_symbols() {
        let mut child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        let pid = child.id() as libc::pid_t;

        let err = resolve(pid).expect_err("sleep(1) has no call_stack symbol");
        match err {
            IntrospectionError::MissingSymbol(_) | IntrospectionError::ImageResolutionFailed(_, _) => {}
            other => panic!("unexpected error: {other:?}"),
        }

        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    fn find_load_addr_rejects_unmapped_exe() {
        let err = find_load_addr(std::process::id() as libc::pid_t, Path::new("/nonexistent/path"))
            .expect_err("no mapping should match a path that isn't mapped");
        assert!(matches!(err, IntrospectionError::ImageResolutionFailed(_, _)));
    }
}
