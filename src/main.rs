#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("ropvm requires Linux (/proc/<pid>/mem). This binary was built for a non-Linux target.");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
fn main() -> anyhow::Result<()> {
    linux::run()
}

#[cfg(target_os = "linux")]
mod linux {
    use std::os::unix::fs::MetadataExt;
    use std::path::{Path, PathBuf};

    use anyhow::Context;
    use clap::{Parser, Subcommand};
    use colored::Colorize;

    use ropvm::chain::{Chain, ChainLayout};
    use ropvm::config::{self, ModuleBases, TargetConfig, TargetContext};
    use ropvm::emulator::{Emulator, IndirectCall};
    use ropvm::memory::Memory;
    use ropvm::pivot::{DispatchPivot, SPRINGBOARD_SIZE};
    use ropvm::procmem::ProcessMemory;
    use ropvm::types::Addr;
    use ropvm::verify;

    #[derive(Parser)]
    #[command(name = "ropvm", about = "ROP/JOP chain engine for Linux x86_64 targets")]
    struct Cli {
        /// Increase log verbosity (-v debug, -vv trace)
        #[arg(short, long, action = clap::ArgAction::Count, global = true)]
        verbose: u8,

        #[command(subcommand)]
        command: Command,
    }

    #[derive(Subcommand)]
    enum Command {
        /// Resolve a target config and print its gadget table
        Gadgets {
            config: PathBuf,
            /// Module base, NAME=ADDR (repeatable)
            #[arg(short, long = "base")]
            bases: Vec<String>,
        },
        /// Check resolved gadget bytes in a live process
        Verify {
            config: PathBuf,
            #[arg(short, long)]
            pid: i32,
            /// Module base, NAME=ADDR (repeatable)
            #[arg(short, long = "base")]
            bases: Vec<String>,
        },
        /// Build and run sample chains against the emulator
        Demo {
            config: PathBuf,
            /// Module base, NAME=ADDR (repeatable); missing modules get
            /// synthetic bases
            #[arg(short, long = "base")]
            bases: Vec<String>,
        },
    }

    pub fn run() -> anyhow::Result<()> {
        let cli = Cli::parse();
        init_logging(cli.verbose);

        match cli.command {
            Command::Gadgets { config, bases } => cmd_gadgets(&config, &bases),
            Command::Verify { config, pid, bases } => cmd_verify(&config, pid, &bases),
            Command::Demo { config, bases } => cmd_demo(&config, &bases),
        }
    }

    fn init_logging(verbose: u8) {
        let level = match verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        };
        env_logger::Builder::new()
            .filter_level(level)
            .parse_default_env()
            .init();
    }

    fn load(path: &Path) -> anyhow::Result<TargetConfig> {
        TargetConfig::load(path).with_context(|| format!("loading {}", path.display()))
    }

    fn parse_bases(args: &[String]) -> anyhow::Result<ModuleBases> {
        let mut bases = ModuleBases::new();
        for arg in args {
            let (name, addr) = config::parse_base_arg(arg)?;
            bases.insert(name, addr);
        }
        Ok(bases)
    }

    fn print_target(target: &TargetContext) {
        println!(
            "{} target `{}`",
            "ropvm".bold().cyan(),
            target.name().bold()
        );
        for (gadget, addr) in target.gadgets().entries() {
            println!("  {:016x}  {:<14} {}", addr.addr(), gadget.name(), gadget.text());
        }
        for gadget in target.gadgets().missing() {
            println!("  {:>16}  {:<14} {}", "-".dimmed(), gadget.name(), "missing".yellow());
        }
        match target.context_routines() {
            Ok(r) => println!("  context routines: save {}, resume {}", r.save, r.resume),
            Err(_) => println!("  context routines: {}", "none".yellow()),
        }
    }

    fn cmd_gadgets(path: &Path, bases: &[String]) -> anyhow::Result<()> {
        let config = load(path)?;
        let target = TargetContext::resolve(&config, &parse_bases(bases)?)?;
        print_target(&target);
        Ok(())
    }

    fn cmd_verify(path: &Path, pid: i32, bases: &[String]) -> anyhow::Result<()> {
        let config = load(path)?;
        let target = TargetContext::resolve(&config, &parse_bases(bases)?)?;
        let pid = nix::unistd::Pid::from_raw(pid);
        let mem = ProcessMemory::open(pid)?;

        let report = verify::verify_gadgets(&mem, target.gadgets());
        print!("{}", report);
        if report.is_ok() {
            println!("{} all resolved gadgets match in process {}", "ok".green(), pid);
            Ok(())
        } else {
            let bad = report.failures().count();
            anyhow::bail!("{} gadget(s) do not match in process {}", bad, pid)
        }
    }

    // Emulated address space for `demo`.
    const SYNTHETIC_BASE: u64 = 0x7f00_0000_0000;
    const SYNTHETIC_STRIDE: u64 = 0x100_0000;
    const STACK_REGION: Addr = Addr(0x1000_0000);
    const STACK: Addr = Addr(0x1000_8000);
    const STACK_CAPACITY: usize = 0x4000;
    const SCRATCH: Addr = Addr(0x2000_0000);
    const SLOT: Addr = Addr(0x3000_0000);
    const SPRINGBOARD: Addr = Addr(0x3000_1000);
    const ORIGINAL_HANDLER: u64 = 0x4141_4141;

    type DemoChain<'t> = Chain<'t, Emulator, DispatchPivot<IndirectCall>>;

    fn demo_bases(config: &TargetConfig, args: &[String]) -> anyhow::Result<ModuleBases> {
        let mut bases = parse_bases(args)?;
        for (i, module) in config.modules().into_iter().enumerate() {
            bases
                .entry(module.to_string())
                .or_insert(Addr(SYNTHETIC_BASE + SYNTHETIC_STRIDE * i as u64));
        }
        Ok(bases)
    }

    fn demo_chain(target: &TargetContext) -> anyhow::Result<DemoChain<'_>> {
        let mut emu = Emulator::new();
        emu.install_gadgets(target.gadgets())?;
        emu.map(STACK_REGION, 0x10000);
        emu.map(SCRATCH, 0x1000);
        emu.map(SLOT, 8);
        emu.map(SPRINGBOARD, SPRINGBOARD_SIZE);
        emu.write_u64(SLOT, ORIGINAL_HANDLER)?;
        if let Ok(routines) = target.context_routines() {
            emu.register_context_routines(routines);
        }
        let uid = std::fs::metadata("/proc/self")?.uid() as u64;
        let pid = std::process::id() as u64;
        emu.register_syscall(target.syscall_number("getuid")?, move |_, _| uid);
        emu.register_syscall(target.syscall_number("getpid")?, move |_, _| pid);

        let trigger = IndirectCall {
            slot: SLOT,
            this: SPRINGBOARD,
        };
        let pivot = DispatchPivot::new(target, SLOT, SPRINGBOARD, trigger)?;
        let layout = ChainLayout {
            stack: STACK,
            capacity: STACK_CAPACITY,
            scratch: SCRATCH,
        };
        Ok(Chain::new(target, emu, pivot, layout))
    }

    fn section(title: &str) {
        println!("\n{}", title.bold().green());
    }

    fn cmd_demo(path: &Path, bases: &[String]) -> anyhow::Result<()> {
        let config = load(path)?;
        let target = TargetContext::resolve(&config, &demo_bases(&config, bases)?)?;
        print_target(&target);
        let mut chain = demo_chain(&target)?;

        section("one-shot getuid()");
        chain.syscall("getuid", &[])?;
        println!("  retval = {}", chain.retval()?);

        section("if getuid() == 0 { getpid() }");
        chain.push_syscall("getuid", &[])?;
        chain.start_branch()?;
        chain.push_syscall("getpid", &[])?;
        chain.push_get_retval()?;
        chain.end_branch()?;
        chain.push_end()?;
        print!("{}", chain.dump());
        chain.run()?;
        let skipped = chain.branch_flag()?;
        println!(
            "  region {}, {} steps",
            if skipped { "skipped".yellow() } else { "taken".green() },
            chain.memory().steps()
        );
        chain.clean();

        if target.context_routines().is_ok() {
            section("checkpoint around getpid()");
            chain.memory_mut().registers_mut().rbx = 0x1111;
            chain.push_save()?;
            chain.push_syscall("getpid", &[])?;
            chain.push_get_retval()?;
            chain.push_restore(false)?;
            chain.push_end()?;
            print!("{}", chain.dump());
            chain.run()?;
            println!(
                "  retval = {}, rbx after restore = {:#x}",
                chain.retval()?,
                chain.memory().registers().rbx
            );
        }

        println!(
            "\n{} dispatch slot restored to {:#x}",
            "ok".green(),
            chain.memory().read_u64(SLOT)?
        );
        Ok(())
    }
}
