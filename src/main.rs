use clap::{App, Arg};
use iz80::*;

mod banked_memory;
mod boot;
mod config;
mod console;
mod disk;
mod hbios;
mod hbios_disk;
mod hbios_video;
mod machine;
mod rtc;

#[cfg(test)]
mod dispatch_test;

use self::boot::RomApp;
use self::config::Config;
use self::disk::{valid_image_size, NUM_HARD_DISKS};
use self::hbios::BlockingPolicy;
use self::machine::RomwbwMachine;

fn main() {
    // Load configuration from file (or use defaults)
    let config = Config::load();
    let welcome = "izromwbw - RomWBW HBIOS Emulator\nhttps://github.com/eneilson/izromwbw";

    // Parse arguments
    let matches = App::new(welcome)
        .arg(Arg::with_name("ROM")
            .help("RomWBW ROM image file. Empty to use config default")
            .required(false)
            .index(1))
        .arg(Arg::with_name("disk")
            .short("k")
            .long("disk")
            .takes_value(true)
            .multiple(true)
            .number_of_values(1)
            .help("Attach a hard disk image: FILE or UNIT=FILE (units 0-15)"))
        .arg(Arg::with_name("romapp")
            .short("a")
            .long("romapp")
            .takes_value(true)
            .multiple(true)
            .number_of_values(1)
            .help("Register a bootable OS image: K=Name:path or K:path"))
        .arg(Arg::with_name("boot")
            .short("b")
            .long("boot")
            .takes_value(true)
            .help("Boot command typed into the loader automatically"))
        .arg(Arg::with_name("cmdline")
            .short("l")
            .long("cmdline")
            .takes_value(true)
            .help("Argument line for the guest's host-file utilities"))
        .arg(Arg::with_name("escape")
            .short("e")
            .long("escape")
            .takes_value(true)
            .help("Console escape character that exits to the host (^A-^_ or a literal)"))
        .arg(Arg::with_name("cpu_trace")
            .short("c")
            .long("cpu-trace")
            .help("Traces CPU instruction execution"))
        .arg(Arg::with_name("io_trace")
            .short("i")
            .long("io-trace")
            .help("Traces ports IN and OUT"))
        .arg(Arg::with_name("debug")
            .short("d")
            .long("debug")
            .help("Verbose HBIOS diagnostics on stderr"))
        .arg(Arg::with_name("strict_io")
            .short("s")
            .long("strict-io")
            .help("Halt on access to unknown I/O ports"))
        .arg(Arg::with_name("non_blocking")
            .short("n")
            .long("non-blocking")
            .help("Never block on console reads (embedding hosts)"))
        .get_matches();

    let rom_path = match matches.value_of("ROM").map(|s| s.to_string()).or_else(|| config.rom.clone()) {
        Some(path) => path,
        None => {
            eprintln!("Error: no ROM image given (argument or izromwbw.toml)");
            std::process::exit(1);
        }
    };

    let debug = matches.is_present("debug");
    let trace_cpu = matches.is_present("cpu_trace");
    let trace_io = matches.is_present("io_trace");
    let strict_io = matches.is_present("strict_io") || config.strict_io;
    let blocking = !matches.is_present("non_blocking") && config.blocking;

    println!("{}", welcome);

    // Init machine and CPU
    let mut machine = RomwbwMachine::new();
    machine.trace_io = trace_io;
    machine.strict_io = strict_io;
    machine.mem.debug = debug;
    machine.hbios.debug = debug;
    machine.hbios.blocking = if blocking {
        BlockingPolicy::Blocking
    } else {
        BlockingPolicy::NonBlocking
    };

    // Attach hard disk images: config list first, CLI on top
    for (unit, path) in config.disks.iter().enumerate() {
        attach_disk(&mut machine, unit, path);
    }
    if let Some(specs) = matches.values_of("disk") {
        let mut next_unit = config.disks.len();
        for spec in specs {
            let (unit, path) = match spec.split_once('=') {
                Some((u, p)) => match u.parse::<usize>() {
                    Ok(unit) if unit < NUM_HARD_DISKS => (unit, p),
                    _ => {
                        eprintln!("Error: invalid disk unit in '{}'", spec);
                        std::process::exit(1);
                    }
                },
                None => {
                    let unit = next_unit;
                    next_unit += 1;
                    (unit, spec)
                }
            };
            attach_disk(&mut machine, unit, path);
        }
    }

    // Register ROM applications, skipping files that don't exist
    for app in &config.rom_apps {
        register_rom_app(
            &mut machine,
            app.key.chars().next().unwrap_or('?'),
            app.name.clone(),
            &app.path,
        );
    }
    if let Some(specs) = matches.values_of("romapp") {
        for spec in specs {
            match parse_rom_app_spec(spec) {
                Some((key, name, path)) => register_rom_app(&mut machine, key, name, &path),
                None => {
                    eprintln!("Error: invalid --romapp '{}' (use K=Name:path or K:path)", spec);
                    std::process::exit(1);
                }
            }
        }
    }

    // Load the ROM image and set up the firmware view of the machine
    let rom_data = match std::fs::read(&rom_path) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("Error: cannot read ROM {}: {}", rom_path, e);
            std::process::exit(1);
        }
    };
    machine.mem.load_rom(&rom_data);
    machine.post_rom_setup();
    eprintln!("Loaded {} bytes ROM from {}", rom_data.len(), rom_path);

    if let Some(cmdline) = matches.value_of("cmdline").map(|s| s.to_string()).or(config.cmdline) {
        machine.hbios.host_cmd_line = cmdline;
    }

    if let Some(spec) = matches.value_of("escape") {
        match parse_escape_spec(spec) {
            Some(ch) => {
                machine.console.escape_char = Some(ch);
                if ch < 0x20 {
                    eprintln!("Console escape: ^{}", (ch + b'@') as char);
                } else {
                    eprintln!("Console escape: '{}'", ch as char);
                }
            }
            None => {
                eprintln!("Error: invalid escape char '{}' (use ^A through ^_ or a literal)", spec);
                std::process::exit(1);
            }
        }
    }

    // Queue the auto-boot command as console input, CR-terminated
    if let Some(boot) = matches.value_of("boot").map(|s| s.to_string()).or(config.boot) {
        eprintln!("Auto-boot: '{}'", boot);
        machine.console.queue_line(&boot);
    }

    let mut cpu = Cpu::new_z80();
    cpu.set_trace(trace_cpu);
    cpu.registers().set_pc(0x0000);
    cpu.registers().set16(Reg16::SP, 0x0000); // the ROM sets its own stack

    run(&mut cpu, &mut machine);
}

fn attach_disk(machine: &mut RomwbwMachine, unit: usize, path: &str) {
    if unit >= NUM_HARD_DISKS {
        eprintln!("Error: disk unit {} out of range", unit);
        std::process::exit(1);
    }
    let size = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) => {
            eprintln!("Error: cannot open disk image {}: {}", path, e);
            std::process::exit(1);
        }
    };
    if !valid_image_size(size) {
        eprintln!(
            "Error: {} is {} bytes; not a valid image size \
             (8MB hd1k, 1MB+n*8MB combo, or n*8.32MB hd512)",
            path, size
        );
        std::process::exit(1);
    }
    if let Err(e) = machine.hbios.hard_disks[unit].open_file(path) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    eprintln!("[HBIOS] Attached disk unit {}: {} ({} bytes)", unit, path, size);
}

/// --romapp spec: K=Name:path or K:path (auto-named)
fn parse_rom_app_spec(spec: &str) -> Option<(char, Option<String>, String)> {
    let mut chars = spec.chars();
    let key = chars.next()?;
    if !key.is_ascii_alphabetic() {
        return None;
    }
    let rest = chars.as_str();
    if let Some(stripped) = rest.strip_prefix('=') {
        let (name, path) = stripped.split_once(':')?;
        if name.is_empty() || path.is_empty() {
            return None;
        }
        Some((key, Some(name.to_string()), path.to_string()))
    } else if let Some(path) = rest.strip_prefix(':') {
        if path.is_empty() {
            return None;
        }
        Some((key, None, path.to_string()))
    } else {
        None
    }
}

/// --escape spec: ^X for a control character, or a single literal char
fn parse_escape_spec(spec: &str) -> Option<u8> {
    let bytes = spec.as_bytes();
    if bytes.len() == 2 && bytes[0] == b'^' {
        let c = bytes[1].to_ascii_uppercase();
        if (b'@'..=b'_').contains(&c) {
            return Some(c - b'@');
        }
        return None;
    }
    if bytes.len() == 1 {
        return Some(bytes[0]);
    }
    None
}

fn register_rom_app(machine: &mut RomwbwMachine, key: char, name: Option<String>, path: &str) {
    if !std::path::Path::new(path).exists() {
        eprintln!("[ROMAPP] Warning: {} not found, '{}' not registered", path, key);
        return;
    }
    let name = name.unwrap_or_else(|| Config::auto_app_name(key));
    eprintln!("[ROMAPP] Registered '{}' = {} ({})", key.to_ascii_uppercase(), name, path);
    machine.hbios.rom_apps.push(RomApp {
        key: key.to_ascii_uppercase(),
        name,
        path: path.to_string(),
    });
}

fn run(cpu: &mut Cpu, machine: &mut RomwbwMachine) {
    let mut instruction_count: u64 = 0;

    loop {
        if machine.console.quit_requested {
            println!("\r\nExiting: 3 consecutive ^C received");
            break;
        }
        if machine.console.escape_requested {
            println!("\r\nConsole escape received, exiting");
            break;
        }

        // Firmware traps are serviced in place of the instruction at
        // the trap address
        let pc = cpu.registers().pc();
        if let Some(trap) = machine.hbios.check_trap(pc) {
            machine.handle_trap(cpu, trap);
            instruction_count += 1;
            if machine.hbios.pending_reset.take().is_some() {
                machine.reset_guest();
                cpu.registers().set_pc(0x0000);
            }
            if machine.hbios.waiting_for_input {
                // Non-blocking host holding the PC at the trap; give
                // the terminal a chance before re-entering
                std::thread::sleep(std::time::Duration::from_millis(1));
                machine.console.consume_input();
            }
            continue;
        }

        cpu.execute_instruction(machine);
        instruction_count += 1;

        // Port writes that needed guest registers were deferred to here
        if let Some(request) = machine.pending.take() {
            machine.handle_port_request(cpu, request);
            if machine.hbios.pending_reset.take().is_some() {
                machine.reset_guest();
                cpu.registers().set_pc(0x0000);
            }
        }

        if let Some(fault) = machine.io_fault.take() {
            let regs = cpu.registers();
            eprintln!("\n[STRICT I/O] {} at PC=0x{:04X}", fault, regs.pc());
            eprintln!(
                "  Registers: A=0x{:02X} BC=0x{:04X} DE=0x{:04X} HL=0x{:04X} SP=0x{:04X}",
                regs.get8(Reg8::A),
                regs.get16(Reg16::BC),
                regs.get16(Reg16::DE),
                regs.get16(Reg16::HL),
                regs.get16(Reg16::SP)
            );
            break;
        }

        if cpu.is_halted() {
            println!(
                "\r\nHALT instruction at 0x{:04X} after {} instructions",
                cpu.registers().pc(),
                instruction_count
            );
            if machine.unknown_port_hits() > 0 {
                eprintln!("({} accesses to unknown I/O ports)", machine.unknown_port_hits());
            }
            break;
        }

        // Keep the input queue warm so ^C works in tight guest loops
        if instruction_count % 1024 == 0 {
            machine.console.consume_input();
        }
    }

    // Disks close on shutdown; file-backed images flush first
    for hd in machine.hbios.hard_disks.iter_mut() {
        hd.flush();
    }
}
