use std::collections::HashMap;

use iz80::*;

use crate::banked_memory::BankedMemory;
use crate::console::{Console, ConsoleRead};
use crate::hbios::{Hbios, Trap, HCB_APITYPE, PRTSUM_VECTOR};

// Guest-visible I/O port map (MM_SBC style UART and bank registers,
// plus the emulator service ports)
const PORT_UART_DATA: u8 = 0x68;
const PORT_UART_LSR: u8 = 0x6D;
const PORT_RTC_LATCH: u8 = 0x70;
const PORT_BANK_SEL_RAM: u8 = 0x78;
const PORT_BANK_SEL_ROM: u8 = 0x7C;
const PORT_BANK_COPY: u8 = 0xEC;
const PORT_BANK_CALL: u8 = 0xED;
const PORT_SIGNAL: u8 = 0xEE;
const PORT_DISPATCH: u8 = 0xEF;

/// Port writes that need guest registers cannot be serviced inside
/// `Machine::port_out`; they are recorded here and drained by the outer
/// loop right after the OUT instruction retires.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum PortRequest {
    BankCopy,
    BankCall { bank: u8 },
    Dispatch,
}

pub struct RomwbwMachine {
    pub mem: BankedMemory,
    pub console: Console,
    pub hbios: Hbios,
    pub pending: Option<PortRequest>,
    pub trace_io: bool,
    /// Unknown guest ports halt execution when set; otherwise they are
    /// counted and ignored.
    pub strict_io: bool,
    pub io_fault: Option<String>,
    unknown_ports: HashMap<u8, u32>,
}

impl RomwbwMachine {
    pub fn new() -> RomwbwMachine {
        RomwbwMachine {
            mem: BankedMemory::new(),
            console: Console::new(),
            hbios: Hbios::new(),
            pending: None,
            trace_io: false,
            strict_io: false,
            io_fault: None,
            unknown_ports: HashMap::new(),
        }
    }

    /// Host-side setup after the ROM image is in place: patch APITYPE
    /// so utilities see an HBIOS (not UNA) system, seed RAM bank 0x80
    /// with page zero + HCB, install the ident block, and configure the
    /// disk tables from the HCB.
    pub fn post_rom_setup(&mut self) {
        self.mem.patch_rom(HCB_APITYPE as usize, 0x00);
        for addr in 0x0000..0x0200u16 {
            let byte = self.mem.read_bank(0x00, addr);
            self.mem.write_bank(0x80, addr, byte);
        }
        self.mem.install_ident();
        self.hbios.init_memory_disks(&self.mem);
        self.hbios.populate_disk_unit_table(&mut self.mem);
    }

    /// Service a PC trap: the dispatcher reads and writes guest
    /// registers while borrowing the machine's own parts.
    pub fn handle_trap(&mut self, cpu: &mut Cpu, trap: Trap) {
        let RomwbwMachine {
            mem,
            console,
            hbios,
            ..
        } = self;
        hbios.handle_call(trap, cpu, mem, console);
    }

    /// Drain a pending port request recorded by `port_out`.
    pub fn handle_port_request(&mut self, cpu: &mut Cpu, request: PortRequest) {
        match request {
            PortRequest::BankCopy => self.run_bank_copy(cpu),
            PortRequest::BankCall { bank } => self.run_bank_call(cpu, bank),
            PortRequest::Dispatch => {
                let RomwbwMachine {
                    mem,
                    console,
                    hbios,
                    ..
                } = self;
                hbios.handle_port_dispatch(cpu, mem, console);
            }
        }
    }

    /// Inter-bank copy trigger: banks come from the fixed parameter
    /// cells at 0xFFE4/0xFFE7, addresses from HL/DE, length from BC.
    fn run_bank_copy(&mut self, cpu: &mut Cpu) {
        let src_addr = cpu.registers().get16(Reg16::HL);
        let dst_addr = cpu.registers().get16(Reg16::DE);
        let count = cpu.registers().get16(Reg16::BC);
        let src_bank = self.mem.fetch(0xFFE4);
        let dst_bank = self.mem.fetch(0xFFE7);
        self.hbios
            .bank_copy(&mut self.mem, src_bank, src_addr, dst_bank, dst_addr, count);
    }

    /// Bank-call trigger: the written byte names the target bank and IX
    /// the call address. Only the PRTSUM vector is routed; the guest
    /// proxy handles everything else itself.
    fn run_bank_call(&mut self, cpu: &mut Cpu, bank: u8) {
        let call_addr = cpu.registers().get16(Reg16::IX);
        if self.hbios.debug {
            eprintln!("[HBIOS BNKCALL] port: bank=0x{:02X} IX=0x{:04X}", bank, call_addr);
        }
        if call_addr == PRTSUM_VECTOR {
            let RomwbwMachine {
                console, hbios, ..
            } = self;
            hbios.print_device_summary(console);
        }
    }

    /// Guest warm/cold restart (SYSRESET): firmware runtime state is
    /// reset, queued input dropped, ROM bank 0 mapped back in. The
    /// caller restarts the guest at PC 0.
    pub fn reset_guest(&mut self) {
        self.hbios.reset_runtime();
        self.console.clear_queue();
        self.mem.select_bank(0x00);
    }

    pub fn unknown_port_hits(&self) -> u32 {
        self.unknown_ports.values().sum()
    }

    fn unknown_port(&mut self, port: u8, direction: &str) {
        let count = self.unknown_ports.entry(port).or_insert(0);
        *count += 1;
        if *count == 1 && self.hbios.debug {
            eprintln!("[WARNING: Unknown {} port 0x{:02X}]", direction, port);
        }
        if self.strict_io {
            self.io_fault = Some(format!(
                "unexpected {} port 0x{:02X}",
                direction, port
            ));
        }
    }
}

impl Machine for RomwbwMachine {
    fn peek(&mut self, address: u16) -> u8 {
        self.mem.fetch(address)
    }

    fn poke(&mut self, address: u16, value: u8) {
        self.mem.store(address, value);
    }

    fn port_in(&mut self, address: u16) -> u8 {
        let port = address as u8;
        let value = match port {
            // The UART has no out-of-band EOF; both "no key" and a
            // closed stream read as 0
            PORT_UART_DATA => match self.console.read_char() {
                ConsoleRead::Char(ch) => ch,
                ConsoleRead::None | ConsoleRead::Eof => 0,
            },
            PORT_UART_LSR => {
                // THRE + TEMT always; DR when input is pending
                0x60 | if self.console.has_input() { 0x01 } else { 0x00 }
            }
            0x69..=0x6C | 0x6E..=0x6F => 0x00,
            PORT_RTC_LATCH => 0xFF, // no discrete RTC chip present
            PORT_BANK_SEL_RAM | PORT_BANK_SEL_ROM => self.mem.current_bank(),
            _ => {
                self.unknown_port(port, "IN");
                0xFF
            }
        };
        if self.trace_io {
            eprintln!("IN(0x{:02X}) = 0x{:02X}", port, value);
        }
        value
    }

    fn port_out(&mut self, address: u16, value: u8) {
        let port = address as u8;
        if self.trace_io {
            eprintln!("OUT(0x{:02X}, 0x{:02X})", port, value);
        }
        match port {
            PORT_UART_DATA => self.console.write_char(value),
            0x69..=0x6C | 0x6E..=0x6F => {} // UART config, ignored
            PORT_RTC_LATCH => {}
            PORT_BANK_SEL_RAM | PORT_BANK_SEL_ROM => {
                self.hbios.init_ram_bank_if_needed(&mut self.mem, value);
                self.mem.select_bank(value);
            }
            PORT_BANK_COPY => self.pending = Some(PortRequest::BankCopy),
            PORT_BANK_CALL => self.pending = Some(PortRequest::BankCall { bank: value }),
            PORT_SIGNAL => self.hbios.signal_byte(value),
            PORT_DISPATCH => self.pending = Some(PortRequest::Dispatch),
            _ => self.unknown_port(port, "OUT"),
        }
    }
}
