//! Seccomp PROOF - installs a compiled policy and watches it act
//!
//! Forks a child that installs a policy, then:
//!   - calls getpid()  → policy says `return EPERM`, so it fails with EPERM
//!   - calls getppid() → not in the policy, default is kill → SIGSYS
//!
//! Run with: cargo build --example seccomp_proof && ./target/debug/examples/seccomp_proof

use std::process::exit;

use seccomp_policy::policy::{FilterCompiler, MemorySource, Resolver, SymbolTable, TargetArch, Verdict};
use seccomp_policy::security::{FilterInstaller, ThreadScope};

// write/exit_group/sigaltstack/munmap for println! and a clean exit
const POLICY: &str = "\
write: 1
exit_group: 1
sigaltstack: 1
munmap: 1
brk: 1
mmap: 1
futex: 1
rt_sigprocmask: 1
getpid: return EPERM
";

fn main() {
    println!("┌─────────────────────────────────────────┐");
    println!("│  Seccomp PROOF - Real Enforcement Test │");
    println!("└─────────────────────────────────────────┘\n");

    let Some(arch) = TargetArch::host() else {
        eprintln!("Unsupported host architecture {}", std::env::consts::ARCH);
        exit(1);
    };

    // Compile before forking so the child only has to install.
    let source = MemorySource::new().with_file("proof.policy", POLICY);
    let symbols = SymbolTable::linux_defaults(arch);
    let filter = match Resolver::new(&source, &symbols)
        .resolve("proof.policy", Verdict::Kill)
        .and_then(|policy| FilterCompiler::new(arch).compile(&policy))
    {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("Failed to build policy: {}", e);
            exit(1);
        }
    };
    println!("Compiled {} instructions for {}\n", filter.len(), arch);

    let pid = unsafe { libc::fork() };

    match pid {
        -1 => {
            eprintln!("Fork failed!");
            exit(1);
        }
        0 => {
            // ═══════════════════════════════════════════════════════════════
            // CHILD PROCESS - installs the filter, then misbehaves
            // ═══════════════════════════════════════════════════════════════
            println!("[CHILD] Installing filter...");
            if let Err(e) = FilterInstaller::new(ThreadScope::CurrentThread).install(filter) {
                eprintln!("[CHILD] {}", e);
                // never continue unfiltered
                std::process::abort();
            }

            let ret = unsafe { libc::syscall(libc::SYS_getpid) };
            let errno = std::io::Error::last_os_error();
            println!("[CHILD] getpid() = {} ({})", ret, errno);

            println!("[CHILD] Calling getppid() - I should be KILLED:\n");
            let _ = unsafe { libc::syscall(libc::SYS_getppid) };

            println!("[CHILD] ERROR: I survived! Filter didn't work!");
            exit(1);
        }
        child_pid => {
            // ═══════════════════════════════════════════════════════════════
            // PARENT PROCESS - waits for child and checks how it ended
            // ═══════════════════════════════════════════════════════════════
            let mut status: i32 = 0;
            unsafe { libc::waitpid(child_pid, &mut status, 0) };

            println!("═══════════════════════════════════════════════════════");
            if libc::WIFSIGNALED(status) && libc::WTERMSIG(status) == libc::SIGSYS {
                println!("✅ SUCCESS: child killed by SIGSYS on a syscall outside the policy");
            } else if libc::WIFSIGNALED(status) {
                println!("⚠️  child killed by signal {}", libc::WTERMSIG(status));
            } else if libc::WIFEXITED(status) {
                println!("❌ FAILURE: child exited with code {}", libc::WEXITSTATUS(status));
            } else {
                println!("[PARENT] Child terminated with unknown status: {}", status);
            }
            println!("═══════════════════════════════════════════════════════");
        }
    }
}
