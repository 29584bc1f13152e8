use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

pub const SECTOR_SIZE: usize = 512;
/// 32Kb bank = 64 sectors of 512 bytes
pub const SECTORS_PER_BANK: u32 = 64;

pub const NUM_HARD_DISKS: usize = 16;

/// Sectors per slice for the two on-disk layouts
pub const HD1K_SLICE_SECTORS: u32 = 16384;
pub const HD512_SLICE_SECTORS: u32 = 16640;

const HD1K_SLICE_BYTES: u64 = HD1K_SLICE_SECTORS as u64 * SECTOR_SIZE as u64;
const HD512_SLICE_BYTES: u64 = HD512_SLICE_SECTORS as u64 * SECTOR_SIZE as u64;
const COMBO_PREFIX_BYTES: u64 = 1024 * 1024;

/// Media ids reported to the guest (RomWBW MID_* numbering)
pub const MID_MDROM: u8 = 1;
pub const MID_MDRAM: u8 = 2;
pub const MID_HD: u8 = 4;
pub const MID_HDNEW: u8 = 10;

/// Guest unit numbers 0xC0-0xCF alias the ROM disk. Observed from boot
/// loader behaviour rather than any firmware documentation; removing
/// the alias breaks romldr.
pub const BOOT_UNIT_ALIAS_FIRST: u8 = 0xC0;
pub const BOOT_UNIT_ALIAS_LAST: u8 = 0xCF;

/// Map a guest unit number to a memory disk index (0 = RAM disk,
/// 1 = ROM disk). Units 0-1 are direct, 0x80-0x8F carry the index in
/// the low nibble, and the 0xC0-0xCF aliases select the ROM disk.
pub fn map_md_unit(unit: u8) -> Option<usize> {
    if unit < 2 {
        return Some(unit as usize);
    }
    if (0x80..=0x8F).contains(&unit) {
        return Some(((unit & 0x0F) as usize).min(1));
    }
    if (BOOT_UNIT_ALIAS_FIRST..=BOOT_UNIT_ALIAS_LAST).contains(&unit) {
        return Some(1);
    }
    None
}

/// Map a guest unit number to a hard disk slot. Units 2-17 map to
/// slots 0-15; units 0x90-0x9F carry the slot in the low nibble.
pub fn map_hd_unit(unit: u8) -> Option<usize> {
    if (2..18).contains(&unit) {
        return Some(unit as usize - 2);
    }
    if (0x90..=0x9F).contains(&unit) {
        return Some((unit & 0x0F) as usize);
    }
    None
}

/// Accepted hard disk image sizes:
///   - 8 MiB: single hd1k slice
///   - 1 MiB + k * 8 MiB (k >= 1): MBR-prefixed combo of k hd1k slices
///   - 8.32 MiB: single hd512 slice
///   - any non-zero multiple of 8.32 MiB: hd512 multi-slice
pub fn valid_image_size(size: u64) -> bool {
    if size == HD1K_SLICE_BYTES {
        return true;
    }
    if size > COMBO_PREFIX_BYTES && (size - COMBO_PREFIX_BYTES) % HD1K_SLICE_BYTES == 0 {
        return true;
    }
    size > 0 && size % HD512_SLICE_BYTES == 0
}

/// Memory disk: sectors stored in a contiguous run of 32Kb banks.
/// Index 0 is the RAM disk, index 1 the ROM disk.
#[derive(Clone, Copy, Default)]
pub struct MemDisk {
    pub enabled: bool,
    pub start_bank: u8,
    pub num_banks: u8,
    pub is_rom: bool,
    pub current_lba: u32,
}

impl MemDisk {
    pub fn total_sectors(&self) -> u32 {
        self.num_banks as u32 * SECTORS_PER_BANK
    }

    /// Bank and in-bank byte offset holding the given LBA.
    pub fn sector_location(&self, lba: u32) -> (u8, u16) {
        let bank = self.start_bank + (lba / SECTORS_PER_BANK) as u8;
        let offset = (lba % SECTORS_PER_BANK) as u16 * SECTOR_SIZE as u16;
        (bank, offset)
    }

    pub fn size_kb(&self) -> u32 {
        self.num_banks as u32 * 32
    }
}

pub enum OpenMode {
    ReadOnly,
    ReadWrite,
    ReadWriteCreate,
}

/// Byte-offset random access over a disk image file. Tracks the size
/// so end-of-disk checks do not need a stat per transfer; writes past
/// the end extend the tracked size.
pub struct DiskFile {
    file: File,
    size: u64,
}

impl DiskFile {
    pub fn open(path: &str, mode: OpenMode) -> std::io::Result<DiskFile> {
        let file = match mode {
            OpenMode::ReadOnly => OpenOptions::new().read(true).open(path)?,
            OpenMode::ReadWrite => OpenOptions::new().read(true).write(true).open(path)?,
            OpenMode::ReadWriteCreate => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)?,
        };
        let size = file.metadata()?.len();
        Ok(DiskFile { file, size })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> usize {
        if self.file.seek(SeekFrom::Start(offset)).is_err() {
            return 0;
        }
        match self.file.read(buf) {
            Ok(n) => n,
            Err(_) => 0,
        }
    }

    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> usize {
        if self.file.seek(SeekFrom::Start(offset)).is_err() {
            return 0;
        }
        match self.file.write(buf) {
            Ok(n) => {
                if offset + n as u64 > self.size {
                    self.size = offset + n as u64;
                }
                n
            }
            Err(_) => 0,
        }
    }

    pub fn flush(&mut self) {
        let _ = self.file.flush();
    }
}

/// Storage behind an open hard disk slot. The three kinds genuinely
/// differ in transfer mechanics, so they stay a tagged union rather
/// than sharing a file-like abstraction.
pub enum HardDiskStorage {
    Closed,
    Memory(Vec<u8>),
    File(DiskFile),
}

pub struct HardDisk {
    storage: HardDiskStorage,
    pub path: String,
    pub current_lba: u32,
    size: u64,
    // Slice layout, detected lazily from the MBR on first request
    probed: bool,
    pub partition_base_lba: u32,
    pub slice_size: u32,
    pub is_hd1k: bool,
}

impl HardDisk {
    pub fn closed() -> HardDisk {
        HardDisk {
            storage: HardDiskStorage::Closed,
            path: String::new(),
            current_lba: 0,
            size: 0,
            probed: false,
            partition_base_lba: 0,
            slice_size: HD512_SLICE_SECTORS,
            is_hd1k: false,
        }
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.storage, HardDiskStorage::Closed)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn total_sectors(&self) -> u32 {
        (self.size / SECTOR_SIZE as u64) as u32
    }

    /// Attach an in-memory image. Any size is accepted here; callers
    /// attaching from the command line validate first.
    pub fn open_memory(&mut self, data: Vec<u8>) {
        self.close();
        self.size = data.len() as u64;
        self.storage = HardDiskStorage::Memory(data);
    }

    /// Attach a file-backed image: read-write first, read-only as a
    /// fallback, creating the file as a last resort.
    pub fn open_file(&mut self, path: &str) -> Result<(), String> {
        self.close();
        let file = DiskFile::open(path, OpenMode::ReadWrite)
            .or_else(|_| DiskFile::open(path, OpenMode::ReadOnly))
            .or_else(|_| DiskFile::open(path, OpenMode::ReadWriteCreate))
            .map_err(|e| format!("cannot open disk image {}: {}", path, e))?;
        self.size = file.size();
        self.path = path.to_string();
        self.storage = HardDiskStorage::File(file);
        Ok(())
    }

    pub fn close(&mut self) {
        if let HardDiskStorage::File(ref mut f) = self.storage {
            f.flush();
        }
        self.storage = HardDiskStorage::Closed;
        self.path.clear();
        self.size = 0;
        self.current_lba = 0;
        self.probed = false;
        self.partition_base_lba = 0;
        self.slice_size = HD512_SLICE_SECTORS;
        self.is_hd1k = false;
    }

    /// Read up to buf.len() bytes at the given byte offset. Returns the
    /// byte count actually read; short reads happen at end of disk.
    /// Panics on an open slot with no storage, which would be an
    /// emulator bug rather than a guest error.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> usize {
        match self.storage {
            HardDiskStorage::Closed => 0,
            HardDiskStorage::Memory(ref data) => {
                if offset >= data.len() as u64 {
                    return 0;
                }
                let avail = (data.len() as u64 - offset) as usize;
                let n = buf.len().min(avail);
                buf[..n].copy_from_slice(&data[offset as usize..offset as usize + n]);
                n
            }
            HardDiskStorage::File(ref mut file) => file.read_at(offset, buf),
        }
    }

    /// Write buf at the given byte offset. In-memory images grow with
    /// a zero-filled gap; file-backed images extend the file.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> usize {
        match self.storage {
            HardDiskStorage::Closed => 0,
            HardDiskStorage::Memory(ref mut data) => {
                let end = offset as usize + buf.len();
                if end > data.len() {
                    data.resize(end, 0);
                    self.size = end as u64;
                }
                data[offset as usize..end].copy_from_slice(buf);
                buf.len()
            }
            HardDiskStorage::File(ref mut file) => {
                let n = file.write_at(offset, buf);
                if file.size() > self.size {
                    self.size = file.size();
                }
                n
            }
        }
    }

    pub fn flush(&mut self) {
        if let HardDiskStorage::File(ref mut f) = self.storage {
            f.flush();
        }
    }

    /// Detect the slice layout from the first sector. Runs once and
    /// caches the result:
    ///   1. Valid MBR with a type 0x2E partition: hd1k, base from the
    ///      partition entry's starting LBA.
    ///   2. Exactly 8 MiB: single-slice hd1k at LBA 0.
    ///   3. Anything else: hd512 at LBA 0.
    pub fn ensure_probed(&mut self, debug: bool) {
        if self.probed || !self.is_open() {
            return;
        }
        self.probed = true;
        self.partition_base_lba = 0;
        self.slice_size = HD512_SLICE_SECTORS;
        self.is_hd1k = false;

        let mut mbr = [0u8; SECTOR_SIZE];
        let n = self.read_at(0, &mut mbr);
        if n == SECTOR_SIZE && mbr[510] == 0x55 && mbr[511] == 0xAA {
            for p in 0..4 {
                let entry = 0x1BE + p * 16;
                if mbr[entry + 4] == 0x2E {
                    let lba = mbr[entry + 8] as u32
                        | (mbr[entry + 9] as u32) << 8
                        | (mbr[entry + 10] as u32) << 16
                        | (mbr[entry + 11] as u32) << 24;
                    self.partition_base_lba = lba;
                    self.slice_size = HD1K_SLICE_SECTORS;
                    self.is_hd1k = true;
                    if debug {
                        eprintln!("[HBIOS] hd1k partition (type 0x2E) at LBA {}", lba);
                    }
                    return;
                }
            }
        }
        if self.size == HD1K_SLICE_BYTES {
            self.slice_size = HD1K_SLICE_SECTORS;
            self.is_hd1k = true;
            if debug {
                eprintln!("[HBIOS] hd1k single-slice image (8MB)");
            }
        } else if debug {
            eprintln!("[HBIOS] hd512 layout (size={})", self.size);
        }
    }

    /// Starting LBA of slice N.
    pub fn slice_lba(&self, slice: u8) -> u32 {
        self.partition_base_lba + slice as u32 * self.slice_size
    }
}
