//! x86_64 syscall name table used for display and for `--syscalls` parsing.

use anyhow::{bail, Result};

/// Syscalls traced when none are configured.
pub const DEFAULT_SYSCALLS: &[&str] = &["pread64", "pwrite64", "fsync", "fdatasync", "read", "write"];

const SYSCALLS: &[(&str, u32)] = &[
    ("read", 0),
    ("write", 1),
    ("open", 2),
    ("close", 3),
    ("stat", 4),
    ("fstat", 5),
    ("lstat", 6),
    ("poll", 7),
    ("lseek", 8),
    ("mmap", 9),
    ("mprotect", 10),
    ("munmap", 11),
    ("brk", 12),
    ("pread64", 17),
    ("pwrite64", 18),
    ("readv", 19),
    ("writev", 20),
    ("access", 21),
    ("pipe", 22),
    ("select", 23),
    ("dup", 32),
    ("dup2", 33),
    ("nanosleep", 35),
    ("socket", 41),
    ("connect", 42),
    ("accept", 43),
    ("sendto", 44),
    ("recvfrom", 45),
    ("sendmsg", 46),
    ("recvmsg", 47),
    ("shutdown", 48),
    ("bind", 49),
    ("listen", 50),
    ("clone", 56),
    ("fork", 57),
    ("vfork", 58),
    ("execve", 59),
    ("exit", 60),
    ("wait4", 61),
    ("kill", 62),
    ("fcntl", 72),
    ("flock", 73),
    ("fsync", 74),
    ("fdatasync", 75),
    ("truncate", 76),
    ("ftruncate", 77),
    ("getdents", 78),
    ("getcwd", 79),
    ("chdir", 80),
    ("rename", 82),
    ("mkdir", 83),
    ("rmdir", 84),
    ("creat", 85),
    ("link", 86),
    ("unlink", 87),
    ("symlink", 88),
    ("readlink", 89),
    ("chmod", 90),
    ("fchmod", 91),
    ("chown", 92),
    ("fchown", 93),
    ("lchown", 94),
    ("umask", 95),
    ("sync", 162),
    ("futex", 202),
    ("epoll_wait", 232),
    ("openat", 257),
    ("mkdirat", 258),
    ("fstatat", 262),
    ("unlinkat", 263),
    ("renameat", 264),
    ("faccessat", 269),
    ("splice", 275),
    ("epoll_pwait", 281),
    ("fallocate", 285),
    ("accept4", 288),
    ("recvmmsg", 299),
    ("syncfs", 306),
    ("sendmmsg", 307),
];

/// Returns the syscall number for a name.
pub fn number(name: &str) -> Option<u32> {
    SYSCALLS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, nr)| *nr)
}

/// Returns the name for a syscall number.
pub fn name(nr: u32) -> Option<&'static str> {
    SYSCALLS.iter().find(|(_, n)| *n == nr).map(|(name, _)| *name)
}

/// Parses a list of syscall names or raw numbers.
pub fn parse_list<S: AsRef<str>>(items: &[S]) -> Result<Vec<u32>> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let item = item.as_ref().trim();
        if item.is_empty() {
            continue;
        }
        let nr = match number(item) {
            Some(nr) => nr,
            None => match item.parse::<u32>() {
                Ok(nr) => nr,
                Err(_) => bail!("unknown syscall: {item}"),
            },
        };
        if !out.contains(&nr) {
            out.push(nr);
        }
    }
    Ok(out)
}
