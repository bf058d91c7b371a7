//! Location of the external master (`modpoll`) and slave (`diagslave`) tools.
//!
//! Both tools ship as prebuilt binaries under `<tool dir>/<tool>/<arch>/<tool>`,
//! one directory per supported target triple.

use once_cell::sync::Lazy;
use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

/// Suffix used for any machine name not listed in [`arch_suffix`].
pub const DEFAULT_ARCH_SUFFIX: &str = "i686-linux-gnu";

/// Map a machine name (as reported by `uname -m`) to the tool directory suffix.
pub fn arch_suffix(machine: &str) -> &'static str {
    match machine {
        "amd64" => "x86_64-linux-gnu",
        "aarch64" => "aarch64-linux-gnu",
        "armv7l" => "arm-linux-gnueabihf",
        "i686" => "i686-linux-gnu",
        _ => DEFAULT_ARCH_SUFFIX,
    }
}

static MACHINE: Lazy<String> = Lazy::new(detect_machine);

/// Machine name of the host, detected once per process.
pub fn machine_name() -> &'static str {
    MACHINE.as_str()
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn detect_machine() -> String {
            // SAFETY: `utsname` is plain old data and uname(2) fills it in.
            let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
            if unsafe { libc::uname(&mut uts) } != 0 {
                log::warn!(
                    "uname failed ({}), falling back to compile-time arch",
                    std::io::Error::last_os_error()
                );
                return std::env::consts::ARCH.to_string();
            }
            // SAFETY: uname(2) NUL-terminates every field on success.
            let machine = unsafe { std::ffi::CStr::from_ptr(uts.machine.as_ptr()) };
            machine.to_string_lossy().into_owned()
        }
    } else {
        fn detect_machine() -> String {
            std::env::consts::ARCH.to_string()
        }
    }
}

/// A program plus arguments that always precede the tool arguments.
///
/// `leading_args` lets the tool run through a wrapper, e.g. an emulator such
/// as `qemu-arm` or an interpreter for a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub leading_args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn with_leading_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Build a command with the given tool arguments appended.
    pub fn command<I, S>(&self, args: I) -> tokio::process::Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.leading_args);
        cmd.args(args);
        cmd
    }

    pub fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.leading_args.iter().cloned());
        parts.join(" ")
    }
}

/// Resolved master and slave tool commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub master: ToolCommand,
    pub slave: ToolCommand,
}

impl ToolPaths {
    pub fn for_machine(tool_dir: &Path, machine: &str) -> Self {
        let suffix = arch_suffix(machine);
        Self {
            master: ToolCommand::new(tool_dir.join("modpoll").join(suffix).join("modpoll")),
            slave: ToolCommand::new(tool_dir.join("diagslave").join(suffix).join("diagslave")),
        }
    }

    pub fn for_host(tool_dir: &Path) -> Self {
        Self::for_machine(tool_dir, machine_name())
    }
}
