use std::fs::File;
use std::io::Write;

use iz80::*;

use crate::banked_memory::{BankedMemory, COMMON_BANK};
use crate::console::Console;
use crate::disk::{
    map_hd_unit, map_md_unit, MID_HD, MID_HDNEW, MID_MDRAM, MID_MDROM, SECTOR_SIZE,
};
use crate::hbios::*;

/// Resolution of the unit number in C against the attached devices.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum DiskUnit {
    MemDisk(usize),
    HardDisk(usize),
    None,
}

impl Hbios {
    /// Resolve a guest unit number to a present device. Memory-disk
    /// encodings win over hard-disk encodings, matching the routing
    /// table order.
    pub fn resolve_unit(&self, unit: u8) -> DiskUnit {
        if let Some(idx) = map_md_unit(unit) {
            if self.mem_disks[idx].enabled {
                return DiskUnit::MemDisk(idx);
            }
            return DiskUnit::None;
        }
        if let Some(idx) = map_hd_unit(unit) {
            if idx < self.hard_disks.len() && self.hard_disks[idx].is_open() {
                return DiskUnit::HardDisk(idx);
            }
        }
        DiskUnit::None
    }

    //=========================================================================
    // Disk I/O (DIO)
    //=========================================================================

    pub fn handle_dio(&mut self, cpu: &mut Cpu, mem: &mut BankedMemory, console: &mut Console) {
        let func = cpu.registers().get8(Reg8::B);
        let raw_unit = cpu.registers().get8(Reg8::C);
        let unit = self.resolve_unit(raw_unit);
        let mut result = ERR_NONE;

        match func {
            HBF_DIOSTATUS => match unit {
                DiskUnit::None => {
                    cpu.registers().set8(Reg8::E, 0xFF);
                    result = ERR_NOUNIT;
                }
                _ => cpu.registers().set8(Reg8::E, 0x00),
            },

            HBF_DIORESET => match unit {
                DiskUnit::MemDisk(idx) => self.mem_disks[idx].current_lba = 0,
                DiskUnit::HardDisk(idx) => self.hard_disks[idx].current_lba = 0,
                DiskUnit::None => result = ERR_NOUNIT,
            },

            HBF_DIOSEEK => {
                // 32-bit LBA in DE:HL; bit 31 is the LBA-mode flag and
                // is masked off
                let de = cpu.registers().get16(Reg16::DE);
                let hl = cpu.registers().get16(Reg16::HL);
                let lba = ((de & 0x7FFF) as u32) << 16 | hl as u32;
                match unit {
                    DiskUnit::MemDisk(idx) => self.mem_disks[idx].current_lba = lba,
                    DiskUnit::HardDisk(idx) => self.hard_disks[idx].current_lba = lba,
                    DiskUnit::None => {
                        console.write_str(&format!("\r\n[SEEK ERR] unit={}\r\n", raw_unit));
                        result = ERR_NOUNIT;
                    }
                }
            }

            HBF_DIOREAD => {
                if unit == DiskUnit::None {
                    console.write_str(&format!("\r\n[DIO ERR] unit={}\r\n", raw_unit));
                    cpu.registers().set8(Reg8::E, 0);
                    result = ERR_NOUNIT;
                } else {
                    let buffer = cpu.registers().get16(Reg16::HL);
                    let bank_hint = cpu.registers().get8(Reg8::D);
                    let count = cpu.registers().get8(Reg8::E);
                    let blocks = self.disk_read(mem, unit, buffer, bank_hint, count);
                    cpu.registers().set8(Reg8::E, blocks);
                }
            }

            HBF_DIOWRITE => {
                if unit == DiskUnit::None {
                    cpu.registers().set8(Reg8::E, 0);
                    result = ERR_NOUNIT;
                } else {
                    let buffer = cpu.registers().get16(Reg16::HL);
                    let bank_hint = cpu.registers().get8(Reg8::D);
                    let count = cpu.registers().get8(Reg8::E);
                    match self.disk_write(mem, unit, buffer, bank_hint, count) {
                        Ok(blocks) => cpu.registers().set8(Reg8::E, blocks),
                        Err(err) => {
                            cpu.registers().set8(Reg8::E, 0);
                            result = err;
                        }
                    }
                }
            }

            HBF_DIOFORMAT | HBF_DIODEFMED => result = ERR_NOTIMPL,

            HBF_DIODEVICE => {
                // D = device class, E = index within class, C = attrs.
                // Bit 5 of the attributes marks high capacity, which
                // enables slice enumeration.
                match unit {
                    DiskUnit::MemDisk(idx) => {
                        cpu.registers().set8(Reg8::D, 0x00);
                        cpu.registers().set8(Reg8::E, idx as u8);
                        cpu.registers().set8(Reg8::C, 0x00);
                    }
                    DiskUnit::HardDisk(idx) => {
                        cpu.registers().set8(Reg8::D, 0x09);
                        cpu.registers().set8(Reg8::E, idx as u8);
                        cpu.registers().set8(Reg8::C, 0x20);
                    }
                    DiskUnit::None => {
                        cpu.registers().set8(Reg8::D, 0xFF);
                        cpu.registers().set8(Reg8::E, 0xFF);
                        result = ERR_NOUNIT;
                    }
                }
            }

            HBF_DIOMEDIA => match unit {
                DiskUnit::MemDisk(idx) => {
                    let media = if self.mem_disks[idx].is_rom {
                        MID_MDROM
                    } else {
                        MID_MDRAM
                    };
                    cpu.registers().set8(Reg8::E, media);
                }
                DiskUnit::HardDisk(idx) => {
                    let debug = self.debug;
                    let hd = &mut self.hard_disks[idx];
                    hd.ensure_probed(debug);
                    let media = if hd.is_hd1k { MID_HDNEW } else { MID_HD };
                    cpu.registers().set8(Reg8::E, media);
                }
                DiskUnit::None => {
                    cpu.registers().set8(Reg8::E, 0xFF);
                    result = ERR_NOUNIT;
                }
            },

            HBF_DIOCAP => {
                // Total sectors, DE = high 16 bits, HL = low 16
                let sectors = match unit {
                    DiskUnit::MemDisk(idx) => self.mem_disks[idx].total_sectors(),
                    DiskUnit::HardDisk(idx) => self.hard_disks[idx].total_sectors(),
                    DiskUnit::None => {
                        result = ERR_NOUNIT;
                        0
                    }
                };
                cpu.registers().set16(Reg16::DE, (sectors >> 16) as u16);
                cpu.registers().set16(Reg16::HL, sectors as u16);
            }

            HBF_DIOGEOM => {
                // LBA devices report a fixed dummy geometry:
                // C = sectors/track, D = heads, E = tracks
                cpu.registers().set8(Reg8::C, 63);
                cpu.registers().set8(Reg8::D, 16);
                cpu.registers().set8(Reg8::E, 255);
            }

            _ => {
                if self.debug {
                    eprintln!("[HBIOS DIO] Unhandled function 0x{:02X} (unit={})", func, raw_unit);
                }
                result = ERR_NOFUNC;
            }
        }

        self.set_result(cpu, result);
        self.do_ret(cpu, mem);
    }

    /// Store into the guest transfer buffer. With bit 7 of the hint set
    /// the hint names the bank for the banked window and the common
    /// bank covers addresses at 0x8000 and up; otherwise the CPU-visible
    /// mapping applies.
    fn dma_store(mem: &mut BankedMemory, bank_hint: u8, addr: u16, byte: u8) {
        if bank_hint & 0x80 != 0 {
            if addr >= 0x8000 {
                mem.write_bank(COMMON_BANK, addr - 0x8000, byte);
            } else {
                mem.write_bank(bank_hint, addr, byte);
            }
        } else {
            mem.store(addr, byte);
        }
    }

    fn dma_fetch(mem: &BankedMemory, bank_hint: u8, addr: u16) -> u8 {
        if bank_hint & 0x80 != 0 {
            if addr >= 0x8000 {
                mem.read_bank(COMMON_BANK, addr - 0x8000)
            } else {
                mem.read_bank(bank_hint, addr)
            }
        } else {
            mem.fetch(addr)
        }
    }

    /// Read `count` 512-byte blocks from the unit's current LBA into
    /// the guest buffer. Advances the position by the blocks actually
    /// read and returns that count; running off the end of the disk is
    /// a short transfer, not a failure.
    fn disk_read(
        &mut self,
        mem: &mut BankedMemory,
        unit: DiskUnit,
        buffer: u16,
        bank_hint: u8,
        count: u8,
    ) -> u8 {
        let mut blocks = 0u8;
        match unit {
            DiskUnit::MemDisk(idx) => {
                let md = &mut self.mem_disks[idx];
                for s in 0..count {
                    if md.current_lba >= md.total_sectors() {
                        break;
                    }
                    let (bank, offset) = md.sector_location(md.current_lba);
                    for j in 0..SECTOR_SIZE as u16 {
                        let byte = mem.read_bank(bank, offset + j);
                        let dst = buffer
                            .wrapping_add(s as u16 * SECTOR_SIZE as u16)
                            .wrapping_add(j);
                        Self::dma_store(mem, bank_hint, dst, byte);
                    }
                    md.current_lba += 1;
                    blocks += 1;
                }
            }
            DiskUnit::HardDisk(idx) => {
                let lba = self.hard_disks[idx].current_lba;
                let mut sector = [0u8; SECTOR_SIZE];
                for s in 0..count {
                    let offset = (lba as u64 + s as u64) * SECTOR_SIZE as u64;
                    let n = self.hard_disks[idx].read_at(offset, &mut sector);
                    if n < SECTOR_SIZE {
                        break;
                    }
                    for (j, &byte) in sector.iter().enumerate() {
                        let dst = buffer
                            .wrapping_add(s as u16 * SECTOR_SIZE as u16)
                            .wrapping_add(j as u16);
                        Self::dma_store(mem, bank_hint, dst, byte);
                    }
                    blocks += 1;
                }
                self.hard_disks[idx].current_lba += blocks as u32;
            }
            DiskUnit::None => {}
        }
        blocks
    }

    /// Write `count` 512-byte blocks from the guest buffer at the
    /// unit's current LBA. A ROM disk rejects the whole transfer with
    /// its position unchanged.
    fn disk_write(
        &mut self,
        mem: &mut BankedMemory,
        unit: DiskUnit,
        buffer: u16,
        bank_hint: u8,
        count: u8,
    ) -> Result<u8, u8> {
        let mut blocks = 0u8;
        match unit {
            DiskUnit::MemDisk(idx) => {
                if self.mem_disks[idx].is_rom {
                    return Err(ERR_READONLY);
                }
                let md = &mut self.mem_disks[idx];
                for s in 0..count {
                    if md.current_lba >= md.total_sectors() {
                        break;
                    }
                    let (bank, offset) = md.sector_location(md.current_lba);
                    for j in 0..SECTOR_SIZE as u16 {
                        let src = buffer
                            .wrapping_add(s as u16 * SECTOR_SIZE as u16)
                            .wrapping_add(j);
                        let byte = Self::dma_fetch(mem, bank_hint, src);
                        mem.write_bank(bank, offset + j, byte);
                    }
                    md.current_lba += 1;
                    blocks += 1;
                }
            }
            DiskUnit::HardDisk(idx) => {
                let lba = self.hard_disks[idx].current_lba;
                let mut sector = [0u8; SECTOR_SIZE];
                for s in 0..count {
                    for (j, b) in sector.iter_mut().enumerate() {
                        let src = buffer
                            .wrapping_add(s as u16 * SECTOR_SIZE as u16)
                            .wrapping_add(j as u16);
                        *b = Self::dma_fetch(mem, bank_hint, src);
                    }
                    let offset = (lba as u64 + s as u64) * SECTOR_SIZE as u64;
                    let n = self.hard_disks[idx].write_at(offset, &sector);
                    if n < SECTOR_SIZE {
                        break;
                    }
                    blocks += 1;
                }
                self.hard_disks[idx].flush();
                self.hard_disks[idx].current_lba += blocks as u32;
            }
            DiskUnit::None => {}
        }
        Ok(blocks)
    }

    //=========================================================================
    // Extension functions (EXT): slice info and host file transfer
    //=========================================================================

    pub fn handle_ext(&mut self, cpu: &mut Cpu, mem: &mut BankedMemory) {
        let func = cpu.registers().get8(Reg8::B);
        let mut result = ERR_NONE;

        match func {
            HBF_EXTSLICE => {
                // D = disk unit, E = slice number.
                // Out: B = device attrs, C = media id, DE:HL = slice LBA
                let disk_unit = cpu.registers().get8(Reg8::D);
                let slice = cpu.registers().get8(Reg8::E);
                let mut media_id = MID_HD;
                let mut slice_lba = 0u32;

                match self.resolve_unit(disk_unit) {
                    DiskUnit::MemDisk(idx) => {
                        media_id = if self.mem_disks[idx].is_rom {
                            MID_MDROM
                        } else {
                            MID_MDRAM
                        };
                        if self.debug {
                            eprintln!("[HBIOS EXTSLICE] Memory disk unit 0x{:02X}, no slices", disk_unit);
                        }
                    }
                    DiskUnit::HardDisk(idx) => {
                        let debug = self.debug;
                        let hd = &mut self.hard_disks[idx];
                        hd.ensure_probed(debug);
                        slice_lba = hd.slice_lba(slice);
                        if hd.is_hd1k {
                            media_id = MID_HDNEW;
                        }
                    }
                    DiskUnit::None => result = ERR_NOUNIT,
                }

                cpu.registers().set8(Reg8::B, 0x00);
                cpu.registers().set8(Reg8::C, media_id);
                cpu.registers().set16(Reg16::DE, (slice_lba >> 16) as u16);
                cpu.registers().set16(Reg16::HL, slice_lba as u16);
                if self.debug {
                    eprintln!(
                        "[HBIOS EXTSLICE] unit=0x{:02X} slice={} -> media=0x{:02X} LBA={}",
                        disk_unit, slice, media_id, slice_lba
                    );
                }
            }

            HBF_HOST_OPEN_R => {
                let path = Self::read_guest_path(cpu, mem);
                self.host_read_file = None;
                match File::open(&path) {
                    Ok(f) => {
                        if self.debug {
                            eprintln!("[HOST] Opened for read: {}", path);
                        }
                        self.host_read_file = Some(f);
                    }
                    Err(_) => {
                        if self.debug {
                            eprintln!("[HOST] Failed to open for read: {}", path);
                        }
                        result = ERR_FAILED;
                    }
                }
            }

            HBF_HOST_OPEN_W => {
                let path = Self::read_guest_path(cpu, mem);
                self.host_write_file = None;
                match File::create(&path) {
                    Ok(f) => {
                        if self.debug {
                            eprintln!("[HOST] Opened for write: {}", path);
                        }
                        self.host_write_file = Some(f);
                    }
                    Err(_) => {
                        if self.debug {
                            eprintln!("[HOST] Failed to open for write: {}", path);
                        }
                        result = ERR_FAILED;
                    }
                }
            }

            HBF_HOST_READ => match self.host_read_byte() {
                Some(byte) => cpu.registers().set8(Reg8::E, byte),
                None => result = ERR_FAILED,
            },

            HBF_HOST_WRITE => {
                let byte = cpu.registers().get8(Reg8::E);
                if !self.host_write_byte(byte) {
                    result = ERR_FAILED;
                }
            }

            HBF_HOST_CLOSE => {
                // C = 0 closes the read side, anything else the write side
                if cpu.registers().get8(Reg8::C) == 0 {
                    self.host_read_file = None;
                } else {
                    if let Some(mut f) = self.host_write_file.take() {
                        let _ = f.flush();
                    }
                }
            }

            HBF_HOST_MODE => {
                // C = 0 get, C = 1 set; E = mode (0 auto, 1 text, 2 binary)
                if cpu.registers().get8(Reg8::C) == 0 {
                    let mode = self.host_transfer_mode;
                    cpu.registers().set8(Reg8::E, mode);
                } else {
                    self.host_transfer_mode = cpu.registers().get8(Reg8::E);
                }
            }

            HBF_HOST_GETARG => {
                // E = token index, DE = destination buffer
                let index = cpu.registers().get8(Reg8::E) as usize;
                let buf_addr = cpu.registers().get16(Reg16::DE);
                match self.host_arg(index) {
                    Some(arg) => {
                        let arg = arg.to_string();
                        for (i, b) in arg.bytes().take(255).enumerate() {
                            mem.store(buf_addr.wrapping_add(i as u16), b);
                        }
                        let len = arg.len().min(255) as u16;
                        mem.store(buf_addr.wrapping_add(len), 0);
                    }
                    None => result = ERR_FAILED,
                }
            }

            _ => {
                eprintln!("[HBIOS EXT] Unhandled function 0x{:02X}", func);
                result = ERR_NOFUNC;
            }
        }

        self.set_result(cpu, result);
        self.do_ret(cpu, mem);
    }

    /// NUL-terminated path string from guest memory at DE, 256 bytes max.
    fn read_guest_path(cpu: &mut Cpu, mem: &BankedMemory) -> String {
        let addr = cpu.registers().get16(Reg16::DE);
        let mut path = String::new();
        for i in 0..256 {
            let ch = mem.fetch(addr.wrapping_add(i));
            if ch == 0 {
                break;
            }
            path.push(ch as char);
        }
        path
    }

    //=========================================================================
    // Device summaries
    //=========================================================================

    /// PRTSUM: the formatted device table romldr prints for the 'D'
    /// boot-menu command.
    pub fn print_device_summary(&self, console: &mut Console) {
        console.write_str("\r\nDisk Device Summary\r\n\r\n");
        console.write_str(" Unit Dev       Type    Capacity\r\n");
        console.write_str(" ---- --------- ------- --------\r\n");

        let mut unit = 0;
        for (i, md) in self.mem_disks.iter().enumerate() {
            if md.enabled {
                let kind = if md.is_rom { "ROM" } else { "RAM" };
                console.write_str(&format!(
                    "   {:2} MD{}       {:<7} {:4}KB\r\n",
                    unit,
                    i,
                    kind,
                    md.size_kb()
                ));
                unit += 1;
            }
        }
        for (i, hd) in self.hard_disks.iter().enumerate() {
            if hd.is_open() {
                console.write_str(&format!(
                    "   {:2} HDSK{}     Hard    {:4}MB\r\n",
                    unit,
                    i,
                    hd.size() / (1024 * 1024)
                ));
                unit += 1;
            }
        }
        console.write_str("\r\n");
    }

    /// SYSGET DEVLIST: boot-menu inventory of disks and ROM applications.
    pub fn print_device_list(&self, console: &mut Console) {
        for (i, hd) in self.hard_disks.iter().enumerate() {
            if hd.is_open() {
                console.write_str(&format!(" {:2}    HD{}:     Hard Disk\r\n", i, i));
            }
        }
        if !self.rom_apps.is_empty() {
            console.write_str("\r\nROM Applications:\r\n");
            for app in &self.rom_apps {
                console.write_str(&format!("  {}    {}\r\n", app.key, app.name));
            }
        }
    }
}
