//! Symbolic constants usable in policy files
//!
//! Policies write `return ENOENT` or `arg1 == FIONREAD` instead of raw
//! numbers. The parser resolves those names through a `SymbolTable` that
//! the caller hands in; nothing is looked up from global state.

use std::collections::BTreeMap;

use super::arch::TargetArch;

/// Name → integer constant mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable {
    symbols: BTreeMap<String, u64>,
}

macro_rules! libc_symbols {
    ($table:ident; $($name:ident),* $(,)?) => {
        $( $table.insert(stringify!($name), libc::$name as u64); )*
    };
}

impl SymbolTable {
    /// Empty table: only numeric literals resolve.
    pub fn new() -> Self {
        Self::default()
    }

    /// Errno names and the flag constants device policies commonly use,
    /// with the values of `arch`'s kernel ABI.
    ///
    /// The shared constants come from libc; the supported targets agree on
    /// them. The open(2) flags they disagree on come from `open_flags`.
    pub fn linux_defaults(arch: TargetArch) -> Self {
        let mut t = Self::new();

        // errno
        libc_symbols!(t;
            EPERM, ENOENT, ESRCH, EINTR, EIO, ENXIO, E2BIG, ENOEXEC, EBADF, ECHILD,
            EAGAIN, ENOMEM, EACCES, EFAULT, ENOTBLK, EBUSY, EEXIST, EXDEV, ENODEV,
            ENOTDIR, EISDIR, EINVAL, ENFILE, EMFILE, ENOTTY, ETXTBSY, EFBIG, ENOSPC,
            ESPIPE, EROFS, EMLINK, EPIPE, EDOM, ERANGE, EDEADLK, ENAMETOOLONG,
            ENOLCK, ENOSYS, ENOTEMPTY, ELOOP, EWOULDBLOCK, ENOMSG, ENODATA, ETIME,
            EOVERFLOW, EILSEQ, ENOTSOCK, EDESTADDRREQ, EMSGSIZE, EPROTOTYPE,
            ENOPROTOOPT, EPROTONOSUPPORT, EOPNOTSUPP, EAFNOSUPPORT, EADDRINUSE,
            EADDRNOTAVAIL, ENETDOWN, ENETUNREACH, ECONNABORTED, ECONNRESET,
            ENOBUFS, EISCONN, ENOTCONN, ETIMEDOUT, ECONNREFUSED, EHOSTUNREACH,
            EALREADY, EINPROGRESS, ECANCELED, EOWNERDEAD, ENOTSUP,
        );

        // open(2) / fcntl(2)
        libc_symbols!(t;
            O_RDONLY, O_WRONLY, O_RDWR, O_ACCMODE, O_CREAT, O_EXCL, O_NOCTTY,
            O_TRUNC, O_APPEND, O_NONBLOCK, O_DSYNC, O_SYNC, O_NOATIME, O_CLOEXEC,
            O_PATH,
            F_DUPFD, F_DUPFD_CLOEXEC, F_GETFD, F_SETFD, F_GETFL, F_SETFL, F_GETLK,
            F_SETLK, F_SETLKW, F_ADD_SEALS, F_GET_SEALS, FD_CLOEXEC,
            AT_EMPTY_PATH, AT_SYMLINK_NOFOLLOW, AT_REMOVEDIR,
        );

        // mmap(2) / mprotect(2) / madvise(2)
        libc_symbols!(t;
            PROT_NONE, PROT_READ, PROT_WRITE, PROT_EXEC, MAP_SHARED, MAP_PRIVATE,
            MAP_FIXED, MAP_ANONYMOUS, MAP_NORESERVE, MAP_POPULATE, MAP_STACK,
            MAP_FIXED_NOREPLACE, MADV_NORMAL, MADV_RANDOM, MADV_SEQUENTIAL,
            MADV_WILLNEED, MADV_DONTNEED, MADV_REMOVE, MADV_DONTFORK,
            MADV_DONTDUMP, MADV_HUGEPAGE, MADV_NOHUGEPAGE, MREMAP_MAYMOVE,
        );

        // ioctl(2)
        libc_symbols!(t;
            FIONREAD, FIONBIO, FIOCLEX, FIONCLEX, TCGETS, TCSETS, TIOCGWINSZ,
            TIOCSWINSZ,
        );

        // clone(2), sockets, prctl(2), futex(2), misc
        libc_symbols!(t;
            CLONE_VM, CLONE_FS, CLONE_FILES, CLONE_SIGHAND, CLONE_THREAD,
            CLONE_SYSVSEM, CLONE_SETTLS, CLONE_PARENT_SETTID, CLONE_CHILD_CLEARTID,
            CLONE_CHILD_SETTID, CLONE_NEWNS, CLONE_NEWUSER, CLONE_NEWPID,
            CLONE_NEWNET, AF_UNIX, AF_INET, AF_INET6, AF_NETLINK, AF_VSOCK,
            SOCK_STREAM, SOCK_DGRAM, SOCK_SEQPACKET, SOCK_RAW, SOCK_NONBLOCK,
            SOCK_CLOEXEC, SOL_SOCKET, MSG_NOSIGNAL, MSG_DONTWAIT, MSG_PEEK,
            PR_SET_NAME, PR_GET_NAME, PR_SET_NO_NEW_PRIVS, PR_SET_SECCOMP,
            PR_SET_PDEATHSIG, PR_SET_DUMPABLE, FUTEX_WAIT, FUTEX_WAKE,
            FUTEX_REQUEUE, FUTEX_CMP_REQUEUE, FUTEX_WAIT_BITSET, FUTEX_WAKE_BITSET,
            FUTEX_PRIVATE_FLAG, FUTEX_CLOCK_REALTIME, EFD_CLOEXEC, EFD_NONBLOCK,
            EFD_SEMAPHORE, TFD_CLOEXEC, TFD_NONBLOCK, EPOLL_CLOEXEC, SIG_BLOCK,
            SIG_UNBLOCK, SIG_SETMASK, GRND_NONBLOCK, GRND_RANDOM,
            CLOCK_REALTIME, CLOCK_MONOTONIC, CLOCK_BOOTTIME,
        );

        t.extend(open_flags(arch));
        t
    }

    /// Add or replace a symbol.
    pub fn insert(&mut self, name: impl Into<String>, value: u64) -> &mut Self {
        self.symbols.insert(name.into(), value);
        self
    }

    /// Merge another set of symbols over this one.
    pub fn extend<I, S>(&mut self, entries: I) -> &mut Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        for (name, value) in entries {
            self.symbols.insert(name.into(), value);
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// open(2) flags whose bits differ between architectures. Values are the
/// kernel's uapi ones: arm64 swaps the directory/nofollow/direct/largefile
/// bits, x86_64 and riscv64 use the generic layout.
fn open_flags(arch: TargetArch) -> [(&'static str, u64); 5] {
    const O_TMPFILE_BASE: u64 = 0o20000000;
    let (direct, largefile, directory, nofollow) = match arch {
        TargetArch::Aarch64 => (0o200000, 0o400000, 0o40000, 0o100000),
        TargetArch::X86_64 | TargetArch::Riscv64 => (0o40000, 0o100000, 0o200000, 0o400000),
    };
    [
        ("O_DIRECT", direct),
        ("O_LARGEFILE", largefile),
        ("O_DIRECTORY", directory),
        ("O_NOFOLLOW", nofollow),
        ("O_TMPFILE", O_TMPFILE_BASE | directory),
    ]
}
