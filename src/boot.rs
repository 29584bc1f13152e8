use std::fs;

use iz80::*;

use crate::banked_memory::BankedMemory;
use crate::disk::{map_hd_unit, map_md_unit, SECTOR_SIZE};
use crate::hbios::{Hbios, ERR_NONE};

/// A host-side OS image bootable from the loader prompt by a single
/// key, standing in for an application stored in ROM banks.
pub struct RomApp {
    pub key: char,
    pub name: String,
    pub path: String,
}

/// Guest image header, 32 bytes at source offset 0x5E0. The payload
/// follows at 0x600.
const HEADER_OFFSET: u64 = 0x5E0;
const PAYLOAD_OFFSET: u64 = 0x600;

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum BootDevice {
    MemDisk(usize),
    HardDisk(usize),
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum BootTarget {
    App(usize),
    Device { dev: BootDevice, slice: u8 },
    /// Empty command: first enabled memory disk, else first open hard disk
    Default,
}

/// Parse a boot command. Rules, in order, after leading spaces:
///   - single letter matching a registered app key (case-insensitive)
///   - HDn[:s] / MDn[:s]
///   - leading digit: numeric guest unit with optional :s
///   - empty: default device
pub fn parse_boot_command(cmd: &str, apps: &[RomApp]) -> Result<BootTarget, String> {
    let cmd = cmd.trim_start_matches(' ').trim_end();
    if cmd.is_empty() {
        return Ok(BootTarget::Default);
    }

    let bytes = cmd.as_bytes();
    if cmd.len() == 1 && bytes[0].is_ascii_alphabetic() {
        let key = bytes[0].to_ascii_uppercase() as char;
        if let Some(idx) = apps.iter().position(|a| a.key.to_ascii_uppercase() == key) {
            return Ok(BootTarget::App(idx));
        }
        return Err(format!("no ROM application bound to '{}'", key));
    }

    let upper = cmd.to_ascii_uppercase();
    if let Some(rest) = upper.strip_prefix("HD") {
        let (n, slice) = parse_unit_slice(rest)?;
        return Ok(BootTarget::Device {
            dev: BootDevice::HardDisk(n as usize),
            slice,
        });
    }
    if let Some(rest) = upper.strip_prefix("MD") {
        let (n, slice) = parse_unit_slice(rest)?;
        return Ok(BootTarget::Device {
            dev: BootDevice::MemDisk(n as usize),
            slice,
        });
    }

    if bytes[0].is_ascii_digit() {
        let (unit, slice) = parse_unit_slice(cmd)?;
        if let Some(idx) = map_md_unit(unit) {
            return Ok(BootTarget::Device {
                dev: BootDevice::MemDisk(idx),
                slice,
            });
        }
        if let Some(idx) = map_hd_unit(unit) {
            return Ok(BootTarget::Device {
                dev: BootDevice::HardDisk(idx),
                slice,
            });
        }
        return Err(format!("no device at unit {}", unit));
    }

    Err(format!("unrecognized boot command '{}'", cmd))
}

/// "n" or "n:s", both decimal.
fn parse_unit_slice(s: &str) -> Result<(u8, u8), String> {
    let mut parts = s.splitn(2, ':');
    let unit_str = parts.next().unwrap_or("");
    let unit = unit_str
        .parse::<u8>()
        .map_err(|_| format!("invalid unit number '{}'", unit_str))?;
    let slice = match parts.next() {
        Some(t) => t
            .parse::<u8>()
            .map_err(|_| format!("invalid slice number '{}'", t))?,
        None => 0,
    };
    Ok((unit, slice))
}

impl Hbios {
    #[allow(dead_code)] // exercised by the dispatcher tests
    pub fn find_rom_app(&self, key: char) -> Option<usize> {
        let key = key.to_ascii_uppercase();
        self.rom_apps
            .iter()
            .position(|a| a.key.to_ascii_uppercase() == key)
    }

    /// Boot a guest image per the loader contract: read the 32-byte
    /// header at source offset 0x5E0 (load/end/entry, little-endian, at
    /// bytes 26..31), copy end-load bytes from offset 0x600 into guest
    /// memory at the load address, pass the unit in D, and jump to the
    /// entry point. Any failure here is fatal to the emulated machine;
    /// callers report and terminate.
    pub fn boot_from_command(
        &mut self,
        cmd: &str,
        cpu: &mut Cpu,
        mem: &mut BankedMemory,
    ) -> Result<(), String> {
        let target = parse_boot_command(cmd, &self.rom_apps)?;

        let (dev, slice) = match target {
            BootTarget::App(idx) => return self.boot_rom_app(idx, cpu, mem),
            BootTarget::Device { dev, slice } => (dev, slice),
            BootTarget::Default => (self.default_boot_device()?, 0),
        };

        // Resolve the slice base and the unit number handed to the guest
        let (base, unit) = match dev {
            BootDevice::MemDisk(idx) => {
                if idx >= 2 || !self.mem_disks[idx].enabled {
                    return Err(format!("no unit: MD{} is not enabled", idx));
                }
                // Memory disks have no slices; the suffix is ignored
                (0u64, idx as u8)
            }
            BootDevice::HardDisk(idx) => {
                if idx >= self.hard_disks.len() || !self.hard_disks[idx].is_open() {
                    return Err(format!("no unit: HD{} is not attached", idx));
                }
                let debug = self.debug;
                let hd = &mut self.hard_disks[idx];
                hd.ensure_probed(debug);
                let base = hd.slice_lba(slice) as u64 * SECTOR_SIZE as u64;
                (base, (idx + 2) as u8)
            }
        };

        let mut header = [0u8; 32];
        if self.read_boot_source(mem, dev, base + HEADER_OFFSET, &mut header) < 32 {
            return Err("cannot read boot image header".to_string());
        }
        let load_addr = header[26] as u16 | (header[27] as u16) << 8;
        let end_addr = header[28] as u16 | (header[29] as u16) << 8;
        let entry_addr = header[30] as u16 | (header[31] as u16) << 8;
        if end_addr < load_addr {
            return Err(format!(
                "bad boot image header (load 0x{:04X}, end 0x{:04X})",
                load_addr, end_addr
            ));
        }
        if self.debug {
            eprintln!(
                "[BOOT] Load 0x{:04X}-0x{:04X} entry 0x{:04X}",
                load_addr, end_addr, entry_addr
            );
        }

        // Copy in 512-byte chunks; the terminal sector may come up short
        let total = (end_addr - load_addr) as usize;
        let mut copied = 0usize;
        let mut sector = [0u8; SECTOR_SIZE];
        while copied < total {
            let offset = base + PAYLOAD_OFFSET + copied as u64;
            let n = self.read_boot_source(mem, dev, offset, &mut sector);
            if n == 0 {
                break;
            }
            let take = n.min(total - copied);
            for (i, &b) in sector[..take].iter().enumerate() {
                mem.store(load_addr.wrapping_add((copied + i) as u16), b);
            }
            copied += take;
        }
        if self.debug {
            eprintln!("[BOOT] Loaded {} bytes, jumping to 0x{:04X}", copied, entry_addr);
        }

        cpu.registers().set8(Reg8::D, unit);
        cpu.registers().set8(Reg8::E, 0);
        cpu.registers().set_pc(entry_addr);
        self.set_result(cpu, ERR_NONE);
        Ok(())
    }

    fn boot_rom_app(
        &mut self,
        idx: usize,
        cpu: &mut Cpu,
        mem: &mut BankedMemory,
    ) -> Result<(), String> {
        let path = self.rom_apps[idx].path.clone();
        let data =
            fs::read(&path).map_err(|e| format!("cannot load ROM application {}: {}", path, e))?;
        if data.len() < PAYLOAD_OFFSET as usize {
            return Err(format!(
                "ROM application {} too small ({} bytes)",
                path,
                data.len()
            ));
        }

        let h = &data[HEADER_OFFSET as usize..HEADER_OFFSET as usize + 32];
        let load_addr = h[26] as u16 | (h[27] as u16) << 8;
        let end_addr = h[28] as u16 | (h[29] as u16) << 8;
        let entry_addr = h[30] as u16 | (h[31] as u16) << 8;
        if end_addr < load_addr {
            return Err(format!("bad header in ROM application {}", path));
        }
        if self.debug {
            eprintln!(
                "[BOOT] ROM app '{}' load 0x{:04X}-0x{:04X} entry 0x{:04X}",
                self.rom_apps[idx].name, load_addr, end_addr, entry_addr
            );
        }

        let total = (end_addr - load_addr) as usize;
        let payload = &data[PAYLOAD_OFFSET as usize..];
        for (i, &b) in payload.iter().take(total).enumerate() {
            mem.store(load_addr.wrapping_add(i as u16), b);
        }

        cpu.registers().set8(Reg8::D, 0);
        cpu.registers().set8(Reg8::E, 0);
        cpu.registers().set_pc(entry_addr);
        self.set_result(cpu, ERR_NONE);
        Ok(())
    }

    /// Empty boot command: the first enabled memory disk wins, then the
    /// first open hard disk.
    fn default_boot_device(&self) -> Result<BootDevice, String> {
        for (i, md) in self.mem_disks.iter().enumerate() {
            if md.enabled {
                return Ok(BootDevice::MemDisk(i));
            }
        }
        for (i, hd) in self.hard_disks.iter().enumerate() {
            if hd.is_open() {
                return Ok(BootDevice::HardDisk(i));
            }
        }
        Err("no bootable device attached".to_string())
    }

    /// Read source bytes for the boot loader: hard-disk storage or the
    /// memory-disk banks. Returns the byte count actually read.
    fn read_boot_source(
        &mut self,
        mem: &BankedMemory,
        dev: BootDevice,
        offset: u64,
        buf: &mut [u8],
    ) -> usize {
        match dev {
            BootDevice::HardDisk(idx) => self.hard_disks[idx].read_at(offset, buf),
            BootDevice::MemDisk(idx) => {
                let md = &self.mem_disks[idx];
                let total_bytes = md.total_sectors() as u64 * SECTOR_SIZE as u64;
                for (i, b) in buf.iter_mut().enumerate() {
                    let pos = offset + i as u64;
                    if pos >= total_bytes {
                        return i;
                    }
                    let lba = (pos / SECTOR_SIZE as u64) as u32;
                    let (bank, sector_off) = md.sector_location(lba);
                    *b = mem.read_bank(bank, sector_off + (pos % SECTOR_SIZE as u64) as u16);
                }
                buf.len()
            }
        }
    }
}
