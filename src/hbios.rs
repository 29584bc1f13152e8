use std::fs::File;
use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use iz80::*;

use crate::banked_memory::{BankedMemory, COMMON_BANK};
use crate::boot::RomApp;
use crate::console::{Console, ConsoleRead};
use crate::disk::{HardDisk, MemDisk, NUM_HARD_DISKS};
use crate::rtc::WallClock;

/* HBIOS function codes, passed in the B register.
   Numbering follows RomWBW's hbios.inc BF_* definitions. */

// Character I/O (CIO) 0x00-0x0F
pub const HBF_CIOIN: u8 = 0x00;
pub const HBF_CIOOUT: u8 = 0x01;
pub const HBF_CIOIST: u8 = 0x02;
pub const HBF_CIOOST: u8 = 0x03;
pub const HBF_CIOINIT: u8 = 0x04;
pub const HBF_CIOQUERY: u8 = 0x05;
pub const HBF_CIODEVICE: u8 = 0x06;

// Disk I/O (DIO) 0x10-0x1F
pub const HBF_DIOSTATUS: u8 = 0x10;
pub const HBF_DIORESET: u8 = 0x11;
pub const HBF_DIOSEEK: u8 = 0x12;
pub const HBF_DIOREAD: u8 = 0x13;
pub const HBF_DIOWRITE: u8 = 0x14;
pub const HBF_DIOFORMAT: u8 = 0x16;
pub const HBF_DIODEVICE: u8 = 0x17;
pub const HBF_DIOMEDIA: u8 = 0x18;
pub const HBF_DIODEFMED: u8 = 0x19;
pub const HBF_DIOCAP: u8 = 0x1A;
pub const HBF_DIOGEOM: u8 = 0x1B;

// Real-time clock (RTC) 0x20-0x2F
pub const HBF_RTCGETTIM: u8 = 0x20;
pub const HBF_RTCSETTIM: u8 = 0x21;

// Video display adapter (VDA) 0x40-0x4F
pub const HBF_VDAINI: u8 = 0x40;
pub const HBF_VDAQRY: u8 = 0x41;
pub const HBF_VDARES: u8 = 0x42;
pub const HBF_VDASCP: u8 = 0x45;
pub const HBF_VDASAT: u8 = 0x46;
pub const HBF_VDASCO: u8 = 0x47;
pub const HBF_VDAWRC: u8 = 0x48;
pub const HBF_VDAFIL: u8 = 0x49;
pub const HBF_VDASCR: u8 = 0x4B;
pub const HBF_VDAKST: u8 = 0x4C;
pub const HBF_VDAKRD: u8 = 0x4E;
pub const HBF_VDARDC: u8 = 0x4F;

// Sound (SND) 0x50-0x5F
pub const HBF_SNDRESET: u8 = 0x50;
pub const HBF_SNDVOL: u8 = 0x51;
pub const HBF_SNDPRD: u8 = 0x52;
pub const HBF_SNDNOTE: u8 = 0x53;
pub const HBF_SNDPLAY: u8 = 0x54;
pub const HBF_SNDQUERY: u8 = 0x55;
pub const HBF_SNDDUR: u8 = 0x56;
pub const HBF_SNDBEEP: u8 = 0x58;

// Extension functions 0xE0-0xE7 (slice info + host file transfer)
pub const HBF_EXTSLICE: u8 = 0xE0;
pub const HBF_HOST_OPEN_R: u8 = 0xE1;
pub const HBF_HOST_OPEN_W: u8 = 0xE2;
pub const HBF_HOST_READ: u8 = 0xE3;
pub const HBF_HOST_WRITE: u8 = 0xE4;
pub const HBF_HOST_CLOSE: u8 = 0xE5;
pub const HBF_HOST_MODE: u8 = 0xE6;
pub const HBF_HOST_GETARG: u8 = 0xE7;

// System functions 0xF0-0xFF
pub const HBF_SYSRESET: u8 = 0xF0;
pub const HBF_SYSVER: u8 = 0xF1;
pub const HBF_SYSSETBNK: u8 = 0xF2;
pub const HBF_SYSGETBNK: u8 = 0xF3;
pub const HBF_SYSSETCPY: u8 = 0xF4;
pub const HBF_SYSBNKCPY: u8 = 0xF5;
pub const HBF_SYSALLOC: u8 = 0xF6;
pub const HBF_SYSFREE: u8 = 0xF7;
pub const HBF_SYSGET: u8 = 0xF8;
pub const HBF_SYSSET: u8 = 0xF9;
pub const HBF_SYSPEEK: u8 = 0xFA;
pub const HBF_SYSPOKE: u8 = 0xFB;
pub const HBF_SYSINT: u8 = 0xFC;
pub const HBF_SYSBOOT: u8 = 0xFE;

// SYSGET subfunctions (C register)
pub const SYSGET_CIOCNT: u8 = 0x00;
pub const SYSGET_DIOCNT: u8 = 0x10;
pub const SYSGET_RTCCNT: u8 = 0x20;
pub const SYSGET_DSKYCNT: u8 = 0x30;
pub const SYSGET_VDACNT: u8 = 0x40;
pub const SYSGET_SNDCNT: u8 = 0x50;
pub const SYSGET_SWITCH: u8 = 0xC0;
pub const SYSGET_BOOTINFO: u8 = 0xE0;
pub const SYSGET_CPUINFO: u8 = 0xF0;
pub const SYSGET_MEMINFO: u8 = 0xF1;
pub const SYSGET_BNKINFO: u8 = 0xF2;
pub const SYSGET_CPUSPD: u8 = 0xF3;
pub const SYSGET_PANEL: u8 = 0xF4;
pub const SYSGET_APPBNKS: u8 = 0xF5;
pub const SYSGET_DEVLIST: u8 = 0xFD;

// SYSSET subfunctions
pub const SYSSET_SWITCH: u8 = 0xC0;
pub const SYSSET_BOOTINFO: u8 = 0xE0;

/* Result codes (hbios.inc ERR_* values, two's complement in A).
   0xFF is the legacy generic failure. */
pub const ERR_NONE: u8 = 0x00;
#[allow(dead_code)]
pub const ERR_UNDEF: u8 = 0xFF; // -1
pub const ERR_NOTIMPL: u8 = 0xFE; // -2
pub const ERR_NOFUNC: u8 = 0xFD; // -3
pub const ERR_NOUNIT: u8 = 0xFC; // -4
pub const ERR_NOMEM: u8 = 0xFB; // -5
#[allow(dead_code)]
pub const ERR_RANGE: u8 = 0xFA; // -6
#[allow(dead_code)]
pub const ERR_NOMEDIA: u8 = 0xF9; // -7
pub const ERR_NOHW: u8 = 0xF8; // -8
#[allow(dead_code)]
pub const ERR_IO: u8 = 0xF7; // -9
pub const ERR_READONLY: u8 = 0xF6; // -10
#[allow(dead_code)]
pub const ERR_TIMEOUT: u8 = 0xF5; // -11
#[allow(dead_code)]
pub const ERR_BADCFG: u8 = 0xF4; // -12
#[allow(dead_code)]
pub const ERR_INTERNAL: u8 = 0xF3; // -13
pub const ERR_FAILED: u8 = 0xFF;

/// HCB (HBIOS Configuration Block) layout: 0x0100-0x01FF in bank 0.
pub const HCB_BASE: u16 = 0x0100;
pub const HCB_DEVCNT: u16 = HCB_BASE + 0x0C;
pub const HCB_APITYPE: u16 = HCB_BASE + 0x12;
pub const HCB_DRVMAP: u16 = HCB_BASE + 0x20;
pub const HCB_DISKUT: u16 = HCB_BASE + 0x60;
pub const HCB_RAMD_START: u16 = HCB_BASE + 0xDC;
pub const HCB_RAMD_BNKS: u16 = HCB_BASE + 0xDD;
pub const HCB_ROMD_START: u16 = HCB_BASE + 0xDE;
pub const HCB_ROMD_BNKS: u16 = HCB_BASE + 0xDF;
pub const HCB_APP0: u16 = HCB_BASE + 0xE0;
pub const HCB_APP_BNKS: u16 = HCB_BASE + 0xE1;

/// Bank-call entry point; romldr reaches PRTSUM through it.
pub const BANK_CALL_ADDR: u16 = 0xFFF9;
/// PRTSUM vector in the HBIOS bank
pub const PRTSUM_VECTOR: u16 = 0x0406;

/// Drive letters assigned per open hard disk
pub const SLICES_PER_HD: u8 = 4;

/// DISKUT device-class bytes
const DIODEV_MD: u8 = 0x00;
const DIODEV_HDSK: u8 = 0x09;

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Trap {
    MainEntry,
    BankCall,
    Cio,
    Dio,
    Rtc,
    Sys,
    Vda,
    Snd,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum BlockingPolicy {
    /// Terminal host: console reads may sleep-poll until a key arrives.
    Blocking,
    /// Embedding host: never sleep; set waiting_for_input instead.
    NonBlocking,
}

/// Signal-port protocol state. One registration sequence at a time;
/// every completion returns to Idle.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum SignalState {
    Idle,
    /// 0x02 prefix: eight bytes follow, (lo,hi) pairs for CIO, DIO,
    /// RTC, SYS in that order.
    Sequential { handler: usize, low: Option<u8> },
    /// 0x10-0x15 prefix: (lo,hi) pair for the one named handler.
    Prefixed { handler: usize, low: Option<u8> },
}

const HANDLER_NAMES: [&str; 6] = ["CIO", "DIO", "RTC", "SYS", "VDA", "SND"];
const HANDLER_CIO: usize = 0;
const HANDLER_DIO: usize = 1;
const HANDLER_RTC: usize = 2;
const HANDLER_SYS: usize = 3;
const HANDLER_VDA: usize = 4;
const HANDLER_SND: usize = 5;

pub struct Hbios {
    pub debug: bool,

    pub trapping_enabled: bool,
    pub waiting_for_input: bool,
    pub blocking: BlockingPolicy,
    pub(crate) skip_ret: bool,
    pub main_entry: u16,

    /// Per-handler dispatch addresses registered over the signal port;
    /// zero means not registered.
    pub(crate) dispatch: [u16; 6],
    pub(crate) signal: SignalState,

    pub(crate) copy_src_bank: u8,
    pub(crate) copy_dst_bank: u8,
    pub(crate) copy_count: u16,

    // Bump allocator in bank 0x80: HCB end up to the bank boundary.
    // Legacy guests allocate once and never free; SYSFREE is a no-op.
    pub(crate) heap_ptr: u16,

    // Which RAM banks have had page zero + HCB copied from ROM bank 0
    pub(crate) initialized_ram_banks: u16,

    /// Warm/cold restart requested by SYSRESET; serviced by the outer loop.
    pub pending_reset: Option<u8>,

    // VDA state
    pub(crate) vda_rows: u8,
    pub(crate) vda_cols: u8,
    pub(crate) vda_cursor_row: u8,
    pub(crate) vda_cursor_col: u8,
    #[allow(dead_code)] // set by the guest, no attribute query exists
    pub(crate) vda_attr: u8,

    // Sound state
    pub(crate) snd_volume: [u8; 4],
    pub(crate) snd_period: [u16; 4],
    #[allow(dead_code)] // the console-bell sink has no length control
    pub(crate) snd_duration: u16,

    // Host file transfer (EXT 0xE1-0xE7)
    pub(crate) host_read_file: Option<File>,
    pub(crate) host_write_file: Option<File>,
    pub(crate) host_transfer_mode: u8,
    pub host_cmd_line: String,

    pub mem_disks: [MemDisk; 2],
    pub hard_disks: Vec<HardDisk>,
    pub rom_apps: Vec<RomApp>,
}

impl Hbios {
    pub fn new() -> Hbios {
        let mut hard_disks = Vec::with_capacity(NUM_HARD_DISKS);
        for _ in 0..NUM_HARD_DISKS {
            hard_disks.push(HardDisk::closed());
        }
        Hbios {
            debug: false,
            trapping_enabled: false,
            waiting_for_input: false,
            blocking: BlockingPolicy::Blocking,
            skip_ret: false,
            main_entry: 0xFFF0,
            dispatch: [0; 6],
            signal: SignalState::Idle,
            copy_src_bank: 0x8E,
            copy_dst_bank: 0x8E,
            copy_count: 0,
            heap_ptr: 0x0200,
            initialized_ram_banks: 0,
            pending_reset: None,
            vda_rows: 25,
            vda_cols: 80,
            vda_cursor_row: 0,
            vda_cursor_col: 0,
            vda_attr: 0x07,
            snd_volume: [0; 4],
            snd_period: [0; 4],
            snd_duration: 100,
            host_read_file: None,
            host_write_file: None,
            host_transfer_mode: 0,
            host_cmd_line: String::new(),
            mem_disks: [MemDisk::default(); 2],
            hard_disks,
            rom_apps: Vec::new(),
        }
    }

    /// Reset the firmware runtime state for a warm/cold restart.
    /// Trapping stays off until the guest signals 0xFF again. Disk
    /// attachments and memory-disk configuration survive, as they
    /// model hardware; only their positions rewind.
    pub fn reset_runtime(&mut self) {
        self.trapping_enabled = false;
        self.waiting_for_input = false;
        self.skip_ret = false;
        self.main_entry = 0xFFF0;
        self.dispatch = [0; 6];
        self.signal = SignalState::Idle;
        self.copy_src_bank = 0x8E;
        self.copy_dst_bank = 0x8E;
        self.copy_count = 0;
        self.heap_ptr = 0x0200;
        self.initialized_ram_banks = 0;
        self.pending_reset = None;
        self.vda_cursor_row = 0;
        self.vda_cursor_col = 0;
        self.vda_attr = 0x07;
        self.snd_volume = [0; 4];
        self.snd_period = [0; 4];
        self.snd_duration = 100;
        self.host_read_file = None;
        self.host_write_file = None;
        self.host_transfer_mode = 0;
        for md in self.mem_disks.iter_mut() {
            md.current_lba = 0;
        }
        for hd in self.hard_disks.iter_mut() {
            hd.current_lba = 0;
        }
    }

    //=========================================================================
    // Signal port protocol
    //=========================================================================

    /// Advance the signal-port state machine with one byte written by
    /// the guest. Lifecycle bytes (0x01/0xFE/0xFF) and registration
    /// prefixes are only recognized in the idle state.
    pub fn signal_byte(&mut self, value: u8) {
        match self.signal {
            SignalState::Idle => match value {
                0x01 => {
                    if self.debug {
                        eprintln!("[HBIOS] Boot code starting");
                    }
                }
                0x02 => {
                    self.signal = SignalState::Sequential {
                        handler: HANDLER_CIO,
                        low: None,
                    };
                    if self.debug {
                        eprintln!("[HBIOS] Sequential dispatch registration starting");
                    }
                }
                0xFE => {
                    if self.debug {
                        eprintln!("[HBIOS] PREINIT point reached");
                    }
                }
                0xFF => {
                    self.trapping_enabled = true;
                    if self.debug {
                        eprintln!(
                            "[HBIOS] Init complete, trapping enabled at 0x{:04X}",
                            self.main_entry
                        );
                    }
                }
                0x10..=0x15 => {
                    self.signal = SignalState::Prefixed {
                        handler: (value - 0x10) as usize,
                        low: None,
                    };
                }
                _ => {
                    if self.debug {
                        eprintln!("[HBIOS] Unknown signal: 0x{:02X}", value);
                    }
                }
            },
            SignalState::Sequential { handler, low } => match low {
                None => {
                    self.signal = SignalState::Sequential {
                        handler,
                        low: Some(value),
                    };
                }
                Some(lo) => {
                    self.register_dispatch(handler, lo as u16 | (value as u16) << 8);
                    self.signal = if handler + 1 > HANDLER_SYS {
                        SignalState::Idle
                    } else {
                        SignalState::Sequential {
                            handler: handler + 1,
                            low: None,
                        }
                    };
                }
            },
            SignalState::Prefixed { handler, low } => match low {
                None => {
                    self.signal = SignalState::Prefixed {
                        handler,
                        low: Some(value),
                    };
                }
                Some(lo) => {
                    self.register_dispatch(handler, lo as u16 | (value as u16) << 8);
                    self.signal = SignalState::Idle;
                }
            },
        }
    }

    fn register_dispatch(&mut self, handler: usize, addr: u16) {
        if handler < self.dispatch.len() {
            self.dispatch[handler] = addr;
            if self.debug {
                eprintln!("[HBIOS] {} dispatch at 0x{:04X}", HANDLER_NAMES[handler], addr);
            }
        }
    }

    #[allow(dead_code)] // exercised by the dispatcher tests
    pub fn dispatch_addr(&self, handler: usize) -> u16 {
        self.dispatch[handler]
    }

    //=========================================================================
    // Trap detection
    //=========================================================================

    /// A trap fires iff trapping is enabled and the PC sits at the main
    /// entry, the bank-call address, or a registered handler address.
    pub fn check_trap(&self, pc: u16) -> Option<Trap> {
        if !self.trapping_enabled {
            return None;
        }
        if pc == self.main_entry {
            return Some(Trap::MainEntry);
        }
        if pc == BANK_CALL_ADDR {
            return Some(Trap::BankCall);
        }
        for (i, &addr) in self.dispatch.iter().enumerate() {
            if addr != 0 && pc == addr {
                return Some(match i {
                    HANDLER_CIO => Trap::Cio,
                    HANDLER_DIO => Trap::Dio,
                    HANDLER_RTC => Trap::Rtc,
                    HANDLER_SYS => Trap::Sys,
                    HANDLER_VDA => Trap::Vda,
                    _ => Trap::Snd,
                });
            }
        }
        None
    }

    //=========================================================================
    // Dispatch
    //=========================================================================

    pub fn handle_call(
        &mut self,
        trap: Trap,
        cpu: &mut Cpu,
        mem: &mut BankedMemory,
        console: &mut Console,
    ) {
        match trap {
            Trap::MainEntry => self.handle_main_entry(cpu, mem, console),
            Trap::BankCall => self.handle_bank_call(cpu, mem, console),
            Trap::Cio => self.handle_cio(cpu, mem, console),
            Trap::Dio => self.handle_dio(cpu, mem, console),
            Trap::Rtc => self.handle_rtc(cpu, mem),
            Trap::Sys => self.handle_sys(cpu, mem, console),
            Trap::Vda => self.handle_vda(cpu, mem, console),
            Trap::Snd => self.handle_snd(cpu, mem, console),
        }
    }

    /// Main entry (0xFFF0): route on the function code in B.
    pub fn handle_main_entry(
        &mut self,
        cpu: &mut Cpu,
        mem: &mut BankedMemory,
        console: &mut Console,
    ) {
        let func = cpu.registers().get8(Reg8::B);
        match func {
            0x00..=0x0F => self.handle_cio(cpu, mem, console),
            0x10..=0x1F => self.handle_dio(cpu, mem, console),
            0x20..=0x2F => self.handle_rtc(cpu, mem),
            0x30..=0x3F => self.handle_dsky(cpu, mem),
            0x40..=0x4F => self.handle_vda(cpu, mem, console),
            0x50..=0x5F => self.handle_snd(cpu, mem, console),
            0xE0..=0xE7 => self.handle_ext(cpu, mem),
            0xF0..=0xFF => self.handle_sys(cpu, mem, console),
            _ => {
                eprintln!("[HBIOS] Unknown function 0x{:02X}", func);
                self.set_result(cpu, ERR_FAILED);
                self.do_ret(cpu, mem);
            }
        }
    }

    /// Bank call (0xFFF9): the only routed vector is PRTSUM.
    pub fn handle_bank_call(
        &mut self,
        cpu: &mut Cpu,
        mem: &mut BankedMemory,
        console: &mut Console,
    ) {
        let ix = cpu.registers().get16(Reg16::IX);
        if self.debug {
            eprintln!("[HBIOS BNKCALL] IX=0x{:04X}", ix);
        }
        if ix == PRTSUM_VECTOR {
            self.print_device_summary(console);
        }
        self.do_ret(cpu, mem);
    }

    /// Main-entry invocation triggered by a write to the dispatch port.
    /// The guest proxy carries its own RET, so the synthetic return is
    /// suppressed for the duration of the call.
    pub fn handle_port_dispatch(
        &mut self,
        cpu: &mut Cpu,
        mem: &mut BankedMemory,
        console: &mut Console,
    ) {
        self.skip_ret = true;
        self.handle_main_entry(cpu, mem, console);
        self.skip_ret = false;
    }

    //=========================================================================
    // Return convention helpers
    //=========================================================================

    /// A carries the result; Z is set iff A is zero, C iff bit 7 is set.
    pub(crate) fn set_result(&self, cpu: &mut Cpu, result: u8) {
        let regs = cpu.registers();
        regs.set8(Reg8::A, result);
        regs.put_flag(Flag::Z, result == 0);
        regs.put_flag(Flag::C, result & 0x80 != 0);
    }

    /// Synthetic return: pop the return address the guest's CALL/RST
    /// pushed and resume there. Suppressed in port-dispatch mode.
    pub(crate) fn do_ret(&self, cpu: &mut Cpu, mem: &BankedMemory) {
        if self.skip_ret {
            return;
        }
        let sp = cpu.registers().get16(Reg16::SP);
        let lo = mem.fetch(sp) as u16;
        let hi = mem.fetch(sp.wrapping_add(1)) as u16;
        cpu.registers().set16(Reg16::SP, sp.wrapping_add(2));
        cpu.registers().set_pc(hi << 8 | lo);
    }

    /// Read a console character for CIOIN/VDAKRD, honoring the
    /// blocking policy. Returns false when the handler must bail out
    /// with the PC still at the trap address so the guest retries.
    /// A closed input stream never waits: it completes the call so a
    /// piped script cannot wedge the guest.
    pub(crate) fn console_read_into_e(&mut self, cpu: &mut Cpu, console: &mut Console) -> bool {
        if !console.has_input() && !console.at_eof() {
            match self.blocking {
                BlockingPolicy::Blocking => {
                    // Sleep-poll until a key arrives; EOF or a quit
                    // request ends the wait with whatever read_char
                    // reports below.
                    while !console.has_input()
                        && !console.at_eof()
                        && !console.quit_requested
                    {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
                BlockingPolicy::NonBlocking => {
                    self.waiting_for_input = true;
                    if !self.skip_ret {
                        // PC-trap mode: leave PC at the trap, retry later
                        return false;
                    }
                    // Port dispatch: report success with no data; the
                    // guest's polling loop comes back around.
                    cpu.registers().set8(Reg8::E, 0);
                    return true;
                }
            }
        }
        match console.read_char() {
            ConsoleRead::Char(ch) => {
                cpu.registers().set8(Reg8::E, ch);
                self.waiting_for_input = false;
            }
            ConsoleRead::Eof => cpu.registers().set8(Reg8::E, 0xFF),
            ConsoleRead::None => cpu.registers().set8(Reg8::E, 0),
        }
        true
    }

    //=========================================================================
    // Character I/O (CIO)
    //=========================================================================

    pub fn handle_cio(&mut self, cpu: &mut Cpu, mem: &mut BankedMemory, console: &mut Console) {
        let func = cpu.registers().get8(Reg8::B);
        let unit = cpu.registers().get8(Reg8::C);
        let mut result = ERR_NONE;

        match func {
            HBF_CIOIN => {
                if !self.console_read_into_e(cpu, console) {
                    return;
                }
            }
            HBF_CIOOUT => {
                let ch = cpu.registers().get8(Reg8::E);
                console.write_char(ch);
            }
            HBF_CIOIST => {
                // Count of characters waiting, in A
                result = if console.has_input() { 1 } else { 0 };
            }
            HBF_CIOOST => {
                // Output always ready
                cpu.registers().set8(Reg8::E, 0xFF);
            }
            HBF_CIOINIT => {}
            HBF_CIOQUERY => {
                // D = device type (0 = UART), E = unit
                cpu.registers().set8(Reg8::D, 0x00);
                cpu.registers().set8(Reg8::E, unit);
            }
            HBF_CIODEVICE => {
                cpu.registers().set16(Reg16::DE, 0x0000);
            }
            _ => {
                if self.debug {
                    eprintln!("[HBIOS CIO] Unhandled function 0x{:02X}", func);
                }
                result = ERR_NOFUNC;
            }
        }

        self.set_result(cpu, result);
        self.do_ret(cpu, mem);
    }

    //=========================================================================
    // Real-time clock (RTC)
    //=========================================================================

    pub fn handle_rtc(&mut self, cpu: &mut Cpu, mem: &mut BankedMemory) {
        let func = cpu.registers().get8(Reg8::B);
        let mut result = ERR_NONE;

        match func {
            HBF_RTCGETTIM => {
                // Six packed-BCD bytes at the buffer pointed to by HL
                let buffer = cpu.registers().get16(Reg16::HL);
                let bcd = WallClock::now().to_bcd_buffer();
                for (i, &b) in bcd.iter().enumerate() {
                    mem.store(buffer.wrapping_add(i as u16), b);
                }
            }
            HBF_RTCSETTIM => {
                // The emulated clock tracks the host; setting is accepted
                // and ignored.
            }
            _ => {
                if self.debug {
                    eprintln!("[HBIOS RTC] Unhandled function 0x{:02X}", func);
                }
                result = ERR_NOFUNC;
            }
        }

        self.set_result(cpu, result);
        self.do_ret(cpu, mem);
    }

    //=========================================================================
    // System functions (SYS)
    //=========================================================================

    pub fn handle_sys(&mut self, cpu: &mut Cpu, mem: &mut BankedMemory, console: &mut Console) {
        let func = cpu.registers().get8(Reg8::B);
        let subfunc = cpu.registers().get8(Reg8::C);
        let mut result = ERR_NONE;

        match func {
            HBF_SYSRESET => {
                // C: 0x01 = warm start, 0x02 = cold start; the outer
                // loop replays boot. Other subtypes succeed as no-ops.
                if subfunc == 0x01 || subfunc == 0x02 {
                    self.pending_reset = Some(subfunc);
                    return;
                }
            }

            HBF_SYSVER => {
                // Version 3.5.1.0, platform SBC
                cpu.registers().set16(Reg16::DE, 0x3510);
                cpu.registers().set8(Reg8::L, 0x01);
            }

            HBF_SYSSETBNK => {
                let new_bank = subfunc;
                let prev_bank = mem.current_bank();
                self.init_ram_bank_if_needed(mem, new_bank);
                mem.select_bank(new_bank);
                cpu.registers().set8(Reg8::C, prev_bank);
                if self.debug {
                    eprintln!("[HBIOS] SYSSETBNK 0x{:02X} (prev 0x{:02X})", new_bank, prev_bank);
                }
            }

            HBF_SYSGETBNK => {
                let bank = mem.current_bank();
                cpu.registers().set8(Reg8::L, bank);
            }

            HBF_SYSSETCPY => {
                // D = destination bank, E = source bank, HL = count;
                // stored for the SYSBNKCPY that follows
                self.copy_dst_bank = cpu.registers().get8(Reg8::D);
                self.copy_src_bank = cpu.registers().get8(Reg8::E);
                self.copy_count = cpu.registers().get16(Reg16::HL);
                if self.debug {
                    eprintln!(
                        "[HBIOS SYSSETCPY] src=0x{:02X} dst=0x{:02X} count={}",
                        self.copy_src_bank, self.copy_dst_bank, self.copy_count
                    );
                }
            }

            HBF_SYSBNKCPY => {
                let src_addr = cpu.registers().get16(Reg16::HL);
                let dst_addr = cpu.registers().get16(Reg16::DE);
                self.bank_copy(mem, self.copy_src_bank, src_addr, self.copy_dst_bank, dst_addr, self.copy_count);
            }

            HBF_SYSALLOC => {
                let size = cpu.registers().get16(Reg16::HL);
                if self.heap_ptr as u32 + size as u32 <= 0x8000 {
                    let addr = self.heap_ptr;
                    self.heap_ptr += size;
                    cpu.registers().set16(Reg16::HL, addr);
                    if self.debug {
                        eprintln!(
                            "[HBIOS SYSALLOC] {} bytes at 0x{:04X}, heap now 0x{:04X}",
                            size, addr, self.heap_ptr
                        );
                    }
                } else {
                    cpu.registers().set16(Reg16::HL, 0);
                    result = ERR_NOMEM;
                }
            }

            HBF_SYSFREE => {
                // Bump allocator: free is accepted and ignored
            }

            HBF_SYSGET => result = self.handle_sysget(cpu, mem, console, subfunc),

            HBF_SYSSET => match subfunc {
                SYSSET_SWITCH => {}
                SYSSET_BOOTINFO => {
                    if self.debug {
                        eprintln!(
                            "[HBIOS SYSSET] BOOTINFO device={} bank=0x{:02X} slice={}",
                            cpu.registers().get8(Reg8::D),
                            cpu.registers().get8(Reg8::E),
                            cpu.registers().get8(Reg8::L)
                        );
                    }
                }
                _ => {
                    if self.debug {
                        eprintln!("[HBIOS SYSSET] Unhandled subfunction 0x{:02X}", subfunc);
                    }
                }
            },

            HBF_SYSPEEK => {
                let bank = cpu.registers().get8(Reg8::D);
                let addr = cpu.registers().get16(Reg16::HL);
                let byte = if addr < 0x8000 {
                    mem.read_bank(bank, addr)
                } else {
                    mem.fetch(addr)
                };
                cpu.registers().set8(Reg8::E, byte);
            }

            HBF_SYSPOKE => {
                let bank = cpu.registers().get8(Reg8::D);
                let byte = cpu.registers().get8(Reg8::E);
                let addr = cpu.registers().get16(Reg16::HL);
                if addr < 0x8000 {
                    mem.write_bank(bank, addr, byte);
                } else {
                    mem.store(addr, byte);
                }
            }

            HBF_SYSINT => {
                // Interrupt vectors are not managed here
            }

            HBF_SYSBOOT => {
                // HL points at an ASCII boot command, NUL/CR/LF terminated
                let cmd_addr = cpu.registers().get16(Reg16::HL);
                let mut cmd = String::new();
                for i in 0..63 {
                    let c = mem.fetch(cmd_addr.wrapping_add(i));
                    if c == 0 || c == b'\r' || c == b'\n' {
                        break;
                    }
                    cmd.push(c as char);
                }
                if self.debug {
                    eprintln!("[BOOT] Command string: '{}'", cmd);
                }
                if let Err(e) = self.boot_from_command(cmd.trim_start(), cpu, mem) {
                    eprintln!("[BOOT] {}", e);
                    std::process::exit(1);
                }
                // Boot set PC/registers itself; no synthetic return
                return;
            }

            _ => {
                if self.debug {
                    eprintln!("[HBIOS SYS] Unhandled function 0x{:02X}", func);
                }
                result = ERR_NOFUNC;
            }
        }

        self.set_result(cpu, result);
        self.do_ret(cpu, mem);
    }

    fn handle_sysget(
        &mut self,
        cpu: &mut Cpu,
        mem: &mut BankedMemory,
        console: &mut Console,
        subfunc: u8,
    ) -> u8 {
        match subfunc {
            SYSGET_CIOCNT => cpu.registers().set8(Reg8::E, 1),
            SYSGET_DIOCNT => {
                let count = self.mem_disks.iter().filter(|md| md.enabled).count()
                    + self.hard_disks.iter().filter(|hd| hd.is_open()).count();
                cpu.registers().set8(Reg8::E, count as u8);
            }
            SYSGET_RTCCNT => cpu.registers().set8(Reg8::E, 1),
            SYSGET_DSKYCNT => cpu.registers().set8(Reg8::E, 0),
            SYSGET_VDACNT => cpu.registers().set8(Reg8::E, 1),
            SYSGET_SNDCNT => cpu.registers().set8(Reg8::E, 1),
            SYSGET_SWITCH => cpu.registers().set8(Reg8::L, 0x00),
            SYSGET_BOOTINFO => cpu.registers().set8(Reg8::E, 0),
            SYSGET_CPUINFO => {
                // Z80 at 4 MHz
                cpu.registers().set16(Reg16::DE, 0x0004);
                cpu.registers().set16(Reg16::HL, 4000);
            }
            SYSGET_MEMINFO => {
                // D = ROM bank count, E = RAM bank count
                cpu.registers().set8(Reg8::D, 16);
                cpu.registers().set8(Reg8::E, 16);
            }
            SYSGET_BNKINFO => {
                // D = BIOS bank, E = user bank
                cpu.registers().set8(Reg8::D, 0x80);
                cpu.registers().set8(Reg8::E, 0x8E);
            }
            SYSGET_CPUSPD => {
                // H = wait states, L = speed divisor
                cpu.registers().set8(Reg8::H, 0);
                cpu.registers().set8(Reg8::L, 1);
            }
            SYSGET_PANEL => cpu.registers().set8(Reg8::L, 0x00),
            SYSGET_APPBNKS => {
                let first = mem.read_bank(0x80, HCB_APP0);
                let count = mem.read_bank(0x80, HCB_APP_BNKS);
                cpu.registers().set8(Reg8::D, first);
                cpu.registers().set8(Reg8::E, count);
                if self.debug {
                    eprintln!("[HBIOS APPBNKS] first=0x{:02X} count={}", first, count);
                }
            }
            SYSGET_DEVLIST => self.print_device_list(console),
            _ => {
                eprintln!("[HBIOS SYSGET] Unhandled subfunction 0x{:02X}", subfunc);
                cpu.registers().set8(Reg8::E, 0);
            }
        }
        ERR_NONE
    }

    //=========================================================================
    // Bank bookkeeping
    //=========================================================================

    /// First selection of a RAM bank copies page zero and the HCB from
    /// ROM bank 0 (RST vectors plus configuration) and re-patches
    /// APITYPE, so utilities that PEEK the HCB from any bank see an
    /// HBIOS system. Idempotent per bank.
    pub fn init_ram_bank_if_needed(&mut self, mem: &mut BankedMemory, bank: u8) {
        if bank & 0x80 == 0 || bank & 0x70 != 0 {
            return;
        }
        let idx = bank & 0x0F;
        if self.initialized_ram_banks & (1 << idx) != 0 {
            return;
        }
        if self.debug {
            eprintln!("[HBIOS] Initializing RAM bank 0x{:02X}", bank);
        }
        for addr in 0x0000..0x0200u16 {
            let byte = mem.read_bank(0x00, addr);
            mem.write_bank(bank, addr, byte);
        }
        mem.write_bank(bank, HCB_APITYPE, 0x00);
        self.initialized_ram_banks |= 1 << idx;
    }

    /// Inter-bank byte copy. Addresses at or above 0x8000 land in the
    /// common bank with the offset shifted down, on both sides.
    pub fn bank_copy(
        &self,
        mem: &mut BankedMemory,
        src_bank: u8,
        src_addr: u16,
        dst_bank: u8,
        dst_addr: u16,
        count: u16,
    ) {
        if self.debug {
            eprintln!(
                "[HBIOS BNKCPY] {:02X}:{:04X} -> {:02X}:{:04X} count={}",
                src_bank, src_addr, dst_bank, dst_addr, count
            );
        }
        for i in 0..count {
            let (mut s_bank, mut s_addr) = (src_bank, src_addr.wrapping_add(i));
            let (mut d_bank, mut d_addr) = (dst_bank, dst_addr.wrapping_add(i));
            if s_addr >= 0x8000 {
                s_bank = COMMON_BANK;
                s_addr -= 0x8000;
            }
            if d_addr >= 0x8000 {
                d_bank = COMMON_BANK;
                d_addr -= 0x8000;
            }
            let byte = mem.read_bank(s_bank, s_addr);
            mem.write_bank(d_bank, d_addr, byte);
        }
    }

    //=========================================================================
    // Post-ROM-load initialization
    //=========================================================================

    /// Configure the two memory disks from the RAMD/ROMD fields the ROM
    /// build wrote into the HCB.
    pub fn init_memory_disks(&mut self, mem: &BankedMemory) {
        let ramd_start = mem.read_bank(0x00, HCB_RAMD_START);
        let ramd_banks = mem.read_bank(0x00, HCB_RAMD_BNKS);
        let romd_start = mem.read_bank(0x00, HCB_ROMD_START);
        let romd_banks = mem.read_bank(0x00, HCB_ROMD_BNKS);

        if ramd_banks > 0 {
            self.mem_disks[0] = MemDisk {
                enabled: true,
                start_bank: ramd_start,
                num_banks: ramd_banks,
                is_rom: false,
                current_lba: 0,
            };
            eprintln!(
                "[MD] MD0 (RAM disk): banks 0x{:02X}-0x{:02X}, {}KB, {} sectors",
                ramd_start,
                ramd_start + ramd_banks - 1,
                self.mem_disks[0].size_kb(),
                self.mem_disks[0].total_sectors()
            );
        }
        if romd_banks > 0 {
            self.mem_disks[1] = MemDisk {
                enabled: true,
                start_bank: romd_start,
                num_banks: romd_banks,
                is_rom: true,
                current_lba: 0,
            };
            eprintln!(
                "[MD] MD1 (ROM disk): banks 0x{:02X}-0x{:02X}, {}KB, {} sectors",
                romd_start,
                romd_start + romd_banks - 1,
                self.mem_disks[1].size_kb(),
                self.mem_disks[1].total_sectors()
            );
        }
    }

    /// Fill the HCB disk unit table and drive map so romldr and the
    /// guest OS discover the attached devices. Entries go to both ROM
    /// bank 0 (the source later copies are taken from) and RAM bank
    /// 0x80 (the working HBIOS bank).
    pub fn populate_disk_unit_table(&mut self, mem: &mut BankedMemory) {
        let write_both = |mem: &mut BankedMemory, addr: u16, value: u8| {
            mem.patch_rom(addr as usize, value);
            mem.write_bank(0x80, addr, value);
        };

        for i in 0..16u16 {
            for b in 0..4u16 {
                write_both(mem, HCB_DISKUT + i * 4 + b, 0xFF);
            }
        }

        let mut entry = 0u16;
        for (i, md) in self.mem_disks.iter().enumerate() {
            if md.enabled && entry < 16 {
                write_both(mem, HCB_DISKUT + entry * 4, DIODEV_MD);
                write_both(mem, HCB_DISKUT + entry * 4 + 1, i as u8);
                write_both(mem, HCB_DISKUT + entry * 4 + 2, 0x00);
                write_both(mem, HCB_DISKUT + entry * 4 + 3, 0x00);
                if self.debug {
                    eprintln!("[DISKUT] Entry {}: MD{}", entry, i);
                }
                entry += 1;
            }
        }
        for (i, hd) in self.hard_disks.iter().enumerate() {
            if hd.is_open() && entry < 16 {
                write_both(mem, HCB_DISKUT + entry * 4, DIODEV_HDSK);
                write_both(mem, HCB_DISKUT + entry * 4 + 1, i as u8);
                write_both(mem, HCB_DISKUT + entry * 4 + 2, 0x00);
                write_both(mem, HCB_DISKUT + entry * 4 + 3, 0x00);
                if self.debug {
                    eprintln!("[DISKUT] Entry {}: HD{} ({} bytes)", entry, i, hd.size());
                }
                entry += 1;
            }
        }

        // Drive map: A-P, each byte (slice << 4) | unit, 0xFF unused.
        // Memory disks first, then SLICES_PER_HD letters per hard disk.
        for i in 0..16u16 {
            write_both(mem, HCB_DRVMAP + i, 0xFF);
        }
        let mut letter = 0u16;
        for (i, md) in self.mem_disks.iter().enumerate() {
            if md.enabled && letter < 16 {
                write_both(mem, HCB_DRVMAP + letter, i as u8);
                letter += 1;
            }
        }
        for (i, hd) in self.hard_disks.iter().enumerate() {
            if hd.is_open() {
                let unit = (i + 2) as u8;
                for slice in 0..SLICES_PER_HD {
                    if letter >= 16 {
                        break;
                    }
                    write_both(mem, HCB_DRVMAP + letter, (slice << 4) | (unit & 0x0F));
                    letter += 1;
                }
            }
        }

        write_both(mem, HCB_DEVCNT, letter as u8);
        eprintln!(
            "[DISKUT] {} disk entries, {} drive letters in HCB",
            entry, letter
        );
    }

    //=========================================================================
    // Host file transfer helpers (EXT)
    //=========================================================================

    pub(crate) fn host_read_byte(&mut self) -> Option<u8> {
        let file = self.host_read_file.as_mut()?;
        let mut buf = [0u8; 1];
        match file.read(&mut buf) {
            Ok(1) => Some(buf[0]),
            _ => None,
        }
    }

    pub(crate) fn host_write_byte(&mut self, byte: u8) -> bool {
        match self.host_write_file.as_mut() {
            Some(file) => file.write_all(&[byte]).is_ok(),
            None => false,
        }
    }

    /// Space-separated token from the externally supplied command line;
    /// index 0 is the first argument.
    pub(crate) fn host_arg(&self, index: usize) -> Option<&str> {
        self.host_cmd_line.split(' ').filter(|t| !t.is_empty()).nth(index)
    }
}
