//! Policy pipeline walkthrough
//!
//! Parses a two-file policy from memory, compiles it for the host and
//! dry-runs a few syscalls through the compiled program. Nothing is
//! installed, so this is safe to run anywhere.
//!
//! Run with: cargo run --example seccomp_demo

use seccomp_policy::policy::{FilterCompiler, MemorySource, Resolver, SymbolTable, TargetArch, Verdict};

const BASE: &str = "\
# shared by every device process
read: 1
write: 1
exit_group: 1
futex: 1
";

const DEVICE: &str = "\
@include base.policy
@default return EPERM
openat: return ENOENT
ioctl: arg1 == FIONREAD || arg1 == FIONBIO; return ENOTTY
mmap: arg2 in PROT_READ|PROT_WRITE
";

fn main() {
    println!("┌─────────────────────────────────────────┐");
    println!("│  Seccomp Policy Pipeline Demo          │");
    println!("└─────────────────────────────────────────┘\n");

    let arch = TargetArch::host().unwrap_or(TargetArch::X86_64);
    let source = MemorySource::new()
        .with_file("base.policy", BASE)
        .with_file("device.policy", DEVICE);
    let symbols = SymbolTable::linux_defaults(arch);

    // ─────────────────────────────────────────────────────────────────────
    // Step 1: Resolve includes
    // ─────────────────────────────────────────────────────────────────────
    println!("1. Resolving device.policy...");
    let policy = match Resolver::new(&source, &symbols).resolve("device.policy", Verdict::Kill) {
        Ok(policy) => policy,
        Err(e) => {
            eprintln!("   ❌ {}", e);
            std::process::exit(1);
        }
    };
    for (name, rule) in &policy.rules {
        println!("   {:<12} {:<10} ({})", name, rule.action.kind(), rule.origin);
    }
    println!("   default: {}\n", policy.default_action);

    // ─────────────────────────────────────────────────────────────────────
    // Step 2: Compile
    // ─────────────────────────────────────────────────────────────────────
    println!("2. Compiling for {}...", arch);
    let filter = match FilterCompiler::new(arch).compile(&policy) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("   ❌ {}", e);
            std::process::exit(1);
        }
    };
    println!(
        "   ✅ {} BPF instructions, {} syscalls\n",
        filter.len(),
        filter.syscalls()
    );

    // ─────────────────────────────────────────────────────────────────────
    // Step 3: Dry run
    // ─────────────────────────────────────────────────────────────────────
    println!("3. Dry-running syscalls through the program:");
    let fionread = libc::FIONREAD as u64;
    let prot_rw = (libc::PROT_READ | libc::PROT_WRITE) as u64;
    let probes: [(&str, [u64; 6]); 7] = [
        ("read", [0; 6]),
        ("openat", [0; 6]),
        ("ioctl", [3, fionread, 0, 0, 0, 0]),
        ("ioctl", [3, 0x5401, 0, 0, 0, 0]),
        ("mmap", [0, 4096, prot_rw, 0, 0, 0]),
        ("mmap", [0, 4096, libc::PROT_EXEC as u64, 0, 0, 0]),
        ("getpid", [0; 6]),
    ];
    for (name, args) in probes {
        match filter.evaluate_syscall(name, &args) {
            Ok(verdict) => {
                let mark = if verdict.is_allow() { "✅" } else { "❌" };
                println!("   {} {:<8} arg1={:#x} arg2={:#x} → {}", mark, name, args[1], args[2], verdict);
            }
            Err(e) => println!("   ⚠️  {}: {}", name, e),
        }
    }

    println!("\n   To enforce it: FilterInstaller::new(scope).install(filter)");
    println!("   (see the seccomp_proof demo)");
}
