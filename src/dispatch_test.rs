#[cfg(test)]
mod tests {
    use iz80::*;

    use crate::banked_memory::COMMON_BANK;
    use crate::boot::RomApp;
    use crate::console::Console;
    use crate::hbios::*;
    use crate::machine::{PortRequest, RomwbwMachine};

    const RET_ADDR: u16 = 0xBEEF;

    /// Machine with a guest stack prepared so synthetic returns can be
    /// verified: SP at 0xFF80 with 0xBEEF pushed. The console is
    /// detached from host stdin so only queued input reaches the guest.
    fn machine() -> (Cpu, RomwbwMachine) {
        let mut machine = RomwbwMachine::new();
        machine.console = Console::detached();
        let mut cpu = Cpu::new_z80();
        machine.mem.store(0xFF80, (RET_ADDR & 0xFF) as u8);
        machine.mem.store(0xFF81, (RET_ADDR >> 8) as u8);
        cpu.registers().set16(Reg16::SP, 0xFF80);
        (cpu, machine)
    }

    /// Machine whose HCB declares a 64KB RAM disk (banks 0x81-0x82)
    /// and a 64KB ROM disk (banks 0x02-0x03), initialized as after ROM
    /// load.
    fn machine_with_mem_disks() -> (Cpu, RomwbwMachine) {
        let (cpu, mut machine) = machine();
        machine.mem.patch_rom(0x01DC, 0x81); // RAM disk start bank
        machine.mem.patch_rom(0x01DD, 2); // RAM disk bank count
        machine.mem.patch_rom(0x01DE, 0x02); // ROM disk start bank
        machine.mem.patch_rom(0x01DF, 2); // ROM disk bank count
        machine.post_rom_setup();
        (cpu, machine)
    }

    fn call(cpu: &mut Cpu, machine: &mut RomwbwMachine, b: u8, c: u8) {
        cpu.registers().set8(Reg8::B, b);
        cpu.registers().set8(Reg8::C, c);
        machine.hbios.trapping_enabled = true;
        let trap = machine.hbios.check_trap(machine.hbios.main_entry).unwrap();
        machine.handle_trap(cpu, trap);
    }

    fn result_of(cpu: &mut Cpu) -> u8 {
        cpu.registers().get8(Reg8::A)
    }

    //=========================================================================
    // Signal protocol
    //=========================================================================

    #[test]
    fn signal_lifecycle_bytes() {
        let (_, mut machine) = machine();
        assert!(!machine.hbios.trapping_enabled);
        machine.hbios.signal_byte(0x01);
        assert!(!machine.hbios.trapping_enabled);
        machine.hbios.signal_byte(0xFE);
        assert!(!machine.hbios.trapping_enabled);
        machine.hbios.signal_byte(0xFF);
        assert!(machine.hbios.trapping_enabled);
        assert_eq!(machine.hbios.main_entry, 0xFFF0);
    }

    #[test]
    fn signal_ff_before_01_is_legal() {
        let (_, mut machine) = machine();
        machine.hbios.signal_byte(0xFF);
        assert!(machine.hbios.trapping_enabled);
    }

    #[test]
    fn sequential_registration_takes_exactly_nine_bytes() {
        let (_, mut machine) = machine();
        machine.hbios.signal_byte(0x02);
        for (i, addr) in [0xF100u16, 0xF200, 0xF300, 0xF400].iter().enumerate() {
            machine.hbios.signal_byte((*addr & 0xFF) as u8);
            machine.hbios.signal_byte((*addr >> 8) as u8);
            assert_eq!(machine.hbios.dispatch_addr(i), *addr);
        }
        // Back to idle: the next 0x02-class byte starts fresh, and a
        // lifecycle byte is interpreted as such
        machine.hbios.signal_byte(0xFF);
        assert!(machine.hbios.trapping_enabled);
    }

    #[test]
    fn prefixed_registration_takes_exactly_three_bytes() {
        let (_, mut machine) = machine();
        for (i, prefix) in (0x10u8..=0x15).enumerate() {
            let addr = 0xE000u16 + i as u16;
            machine.hbios.signal_byte(prefix);
            machine.hbios.signal_byte((addr & 0xFF) as u8);
            machine.hbios.signal_byte((addr >> 8) as u8);
            assert_eq!(machine.hbios.dispatch_addr(i), addr);
        }
        // Idle again
        machine.hbios.signal_byte(0xFF);
        assert!(machine.hbios.trapping_enabled);
    }

    #[test]
    fn unknown_idle_byte_is_ignored() {
        let (_, mut machine) = machine();
        machine.hbios.signal_byte(0x77);
        machine.hbios.signal_byte(0xFF);
        assert!(machine.hbios.trapping_enabled);
    }

    #[test]
    fn registration_address_bytes_are_not_lifecycle_bytes() {
        let (_, mut machine) = machine();
        // Register CIO at 0x02FF: both bytes would mean something in
        // the idle state but belong to the sequence here
        machine.hbios.signal_byte(0x10);
        machine.hbios.signal_byte(0xFF);
        machine.hbios.signal_byte(0x02);
        assert_eq!(machine.hbios.dispatch_addr(0), 0x02FF);
        assert!(!machine.hbios.trapping_enabled);
    }

    //=========================================================================
    // Trap detection
    //=========================================================================

    #[test]
    fn traps_only_when_enabled() {
        let (_, mut machine) = machine();
        assert_eq!(machine.hbios.check_trap(0xFFF0), None);
        machine.hbios.signal_byte(0xFF);
        assert_eq!(machine.hbios.check_trap(0xFFF0), Some(Trap::MainEntry));
        assert_eq!(machine.hbios.check_trap(0xFFF9), Some(Trap::BankCall));
        assert_eq!(machine.hbios.check_trap(0x1234), None);
    }

    #[test]
    fn registered_handlers_trap_and_zero_does_not() {
        let (_, mut machine) = machine();
        machine.hbios.signal_byte(0xFF);
        machine.hbios.signal_byte(0x11); // DIO prefix
        machine.hbios.signal_byte(0x34);
        machine.hbios.signal_byte(0x12);
        assert_eq!(machine.hbios.check_trap(0x1234), Some(Trap::Dio));
        // An unregistered handler address (0) never matches
        assert_eq!(machine.hbios.check_trap(0x0000), None);
    }

    //=========================================================================
    // CIO
    //=========================================================================

    #[test]
    fn cioin_returns_queued_character_with_synthetic_return() {
        let (mut cpu, mut machine) = machine();
        machine.console.queue_char(b'A');
        call(&mut cpu, &mut machine, HBF_CIOIN, 0);
        assert_eq!(cpu.registers().get8(Reg8::E), b'A');
        assert_eq!(result_of(&mut cpu), ERR_NONE);
        assert!(cpu.registers().get_flag(Flag::Z));
        assert!(!cpu.registers().get_flag(Flag::C));
        assert_eq!(cpu.registers().pc(), RET_ADDR);
        assert_eq!(cpu.registers().get16(Reg16::SP), 0xFF82);
    }

    #[test]
    fn cioin_maps_lf_to_cr() {
        let (mut cpu, mut machine) = machine();
        machine.console.queue_char(b'\n');
        call(&mut cpu, &mut machine, HBF_CIOIN, 0);
        assert_eq!(cpu.registers().get8(Reg8::E), b'\r');
    }

    #[test]
    fn cioin_without_input_holds_pc_in_non_blocking_mode() {
        let (mut cpu, mut machine) = machine();
        machine.hbios.blocking = BlockingPolicy::NonBlocking;
        cpu.registers().set_pc(0xFFF0);
        call(&mut cpu, &mut machine, HBF_CIOIN, 0);
        assert!(machine.hbios.waiting_for_input);
        // No synthetic return happened; the guest retries at the trap
        assert_eq!(cpu.registers().pc(), 0xFFF0);
        assert_eq!(cpu.registers().get16(Reg16::SP), 0xFF80);

        // A queued character completes the retry
        machine.console.queue_char(b'x');
        call(&mut cpu, &mut machine, HBF_CIOIN, 0);
        assert!(!machine.hbios.waiting_for_input);
        assert_eq!(cpu.registers().get8(Reg8::E), b'x');
        assert_eq!(cpu.registers().pc(), RET_ADDR);
    }

    #[test]
    fn cioin_completes_at_end_of_input() {
        let (mut cpu1, mut machine1) = machine();
        machine1.console.close_input();
        // Blocking mode must not wait on a stream that can never
        // produce; the call completes with the EOF marker
        call(&mut cpu1, &mut machine1, HBF_CIOIN, 0);
        assert_eq!(cpu1.registers().get8(Reg8::E), 0xFF);
        assert_eq!(cpu1.registers().pc(), RET_ADDR);

        // Non-blocking mode reports the same instead of waiting
        let (mut cpu2, mut machine2) = machine();
        machine2.hbios.blocking = BlockingPolicy::NonBlocking;
        machine2.console.close_input();
        call(&mut cpu2, &mut machine2, HBF_CIOIN, 0);
        assert!(!machine2.hbios.waiting_for_input);
        assert_eq!(cpu2.registers().get8(Reg8::E), 0xFF);
        assert_eq!(cpu2.registers().pc(), RET_ADDR);
    }

    #[test]
    fn cio_status_functions() {
        let (mut cpu, mut machine) = machine();
        call(&mut cpu, &mut machine, HBF_CIOIST, 0);
        assert_eq!(result_of(&mut cpu), 0);
        machine.console.queue_char(b'q');
        call(&mut cpu, &mut machine, HBF_CIOIST, 0);
        assert_eq!(result_of(&mut cpu), 1);
        assert!(!cpu.registers().get_flag(Flag::Z));

        call(&mut cpu, &mut machine, HBF_CIOOST, 0);
        assert_eq!(cpu.registers().get8(Reg8::E), 0xFF);

        call(&mut cpu, &mut machine, HBF_CIOQUERY, 3);
        assert_eq!(cpu.registers().get8(Reg8::D), 0x00);
        assert_eq!(cpu.registers().get8(Reg8::E), 3);

        call(&mut cpu, &mut machine, HBF_CIODEVICE, 0);
        assert_eq!(cpu.registers().get16(Reg16::DE), 0x0000);
    }

    //=========================================================================
    // DIO on memory disks
    //=========================================================================

    fn seek(cpu: &mut Cpu, machine: &mut RomwbwMachine, unit: u8, lba: u32) {
        cpu.registers().set16(Reg16::DE, (lba >> 16) as u16 | 0x8000);
        cpu.registers().set16(Reg16::HL, lba as u16);
        call(cpu, machine, HBF_DIOSEEK, unit);
        assert_eq!(cpu.registers().get8(Reg8::A), ERR_NONE);
    }

    #[test]
    fn mem_disk_write_read_round_trip() {
        let (mut cpu, mut machine) = machine_with_mem_disks();
        assert_eq!(machine.hbios.mem_disks[0].total_sectors(), 128);

        // Pattern in guest memory at 0x9000
        for i in 0..512u16 {
            machine.mem.store(0x9000 + i, i as u8);
        }

        seek(&mut cpu, &mut machine, 0x00, 5);
        cpu.registers().set16(Reg16::HL, 0x9000);
        cpu.registers().set8(Reg8::D, 0x00);
        cpu.registers().set8(Reg8::E, 1);
        call(&mut cpu, &mut machine, HBF_DIOWRITE, 0x00);
        assert_eq!(result_of(&mut cpu), ERR_NONE);
        assert_eq!(cpu.registers().get8(Reg8::E), 1);
        assert_eq!(machine.hbios.mem_disks[0].current_lba, 6);

        seek(&mut cpu, &mut machine, 0x00, 5);
        cpu.registers().set16(Reg16::HL, 0xA000);
        cpu.registers().set8(Reg8::D, 0x00);
        cpu.registers().set8(Reg8::E, 1);
        call(&mut cpu, &mut machine, HBF_DIOREAD, 0x00);
        assert_eq!(result_of(&mut cpu), ERR_NONE);
        assert_eq!(cpu.registers().get8(Reg8::E), 1);
        assert_eq!(machine.hbios.mem_disks[0].current_lba, 6);
        for i in 0..512u16 {
            assert_eq!(machine.mem.fetch(0xA000 + i), i as u8);
        }
    }

    #[test]
    fn mem_disk_read_stops_at_end() {
        let (mut cpu, mut machine) = machine_with_mem_disks();
        seek(&mut cpu, &mut machine, 0x00, 127);
        cpu.registers().set16(Reg16::HL, 0x9000);
        cpu.registers().set8(Reg8::D, 0x00);
        cpu.registers().set8(Reg8::E, 3);
        call(&mut cpu, &mut machine, HBF_DIOREAD, 0x00);
        assert_eq!(result_of(&mut cpu), ERR_NONE);
        assert_eq!(cpu.registers().get8(Reg8::E), 1);
        assert_eq!(machine.hbios.mem_disks[0].current_lba, 128);
    }

    #[test]
    fn rom_disk_rejects_writes() {
        let (mut cpu, mut machine) = machine_with_mem_disks();
        seek(&mut cpu, &mut machine, 0x01, 2);
        cpu.registers().set16(Reg16::HL, 0x9000);
        cpu.registers().set8(Reg8::D, 0x00);
        cpu.registers().set8(Reg8::E, 1);
        call(&mut cpu, &mut machine, HBF_DIOWRITE, 0x01);
        assert_eq!(result_of(&mut cpu), ERR_READONLY);
        assert!(cpu.registers().get_flag(Flag::C));
        assert!(!cpu.registers().get_flag(Flag::Z));
        assert_eq!(cpu.registers().get8(Reg8::E), 0);
        assert_eq!(machine.hbios.mem_disks[1].current_lba, 2);
    }

    #[test]
    fn dio_read_with_explicit_bank_hint() {
        let (mut cpu, mut machine) = machine_with_mem_disks();
        // Fill RAM disk sector 0 directly in its bank
        for i in 0..512u16 {
            machine.mem.write_bank(0x81, i, 0x5A);
        }
        seek(&mut cpu, &mut machine, 0x00, 0);
        cpu.registers().set16(Reg16::HL, 0x4000);
        cpu.registers().set8(Reg8::D, 0x84); // explicit RAM bank 4
        cpu.registers().set8(Reg8::E, 1);
        call(&mut cpu, &mut machine, HBF_DIOREAD, 0x00);
        assert_eq!(cpu.registers().get8(Reg8::E), 1);
        assert_eq!(machine.mem.read_bank(0x84, 0x4000), 0x5A);
        assert_eq!(machine.mem.read_bank(0x84, 0x41FF), 0x5A);
    }

    #[test]
    fn dio_unit_queries() {
        let (mut cpu, mut machine) = machine_with_mem_disks();

        call(&mut cpu, &mut machine, HBF_DIOSTATUS, 0x00);
        assert_eq!(result_of(&mut cpu), ERR_NONE);
        call(&mut cpu, &mut machine, HBF_DIOSTATUS, 0x07);
        assert_eq!(result_of(&mut cpu), ERR_NOUNIT);

        // The 0xC0 alias reaches the ROM disk
        call(&mut cpu, &mut machine, HBF_DIOMEDIA, 0xC0);
        assert_eq!(cpu.registers().get8(Reg8::E), 1); // MID_MDROM
        call(&mut cpu, &mut machine, HBF_DIOMEDIA, 0x00);
        assert_eq!(cpu.registers().get8(Reg8::E), 2); // MID_MDRAM

        call(&mut cpu, &mut machine, HBF_DIODEVICE, 0x01);
        assert_eq!(cpu.registers().get8(Reg8::D), 0x00);
        assert_eq!(cpu.registers().get8(Reg8::E), 1);
        assert_eq!(cpu.registers().get8(Reg8::C), 0x00);

        call(&mut cpu, &mut machine, HBF_DIOCAP, 0x00);
        assert_eq!(cpu.registers().get16(Reg16::DE), 0);
        assert_eq!(cpu.registers().get16(Reg16::HL), 128);

        call(&mut cpu, &mut machine, HBF_DIOGEOM, 0x00);
        assert_eq!(cpu.registers().get8(Reg8::C), 63);
        assert_eq!(cpu.registers().get8(Reg8::D), 16);
        assert_eq!(cpu.registers().get8(Reg8::E), 255);

        call(&mut cpu, &mut machine, HBF_DIOFORMAT, 0x00);
        assert_eq!(result_of(&mut cpu), ERR_NOTIMPL);
    }

    //=========================================================================
    // DIO / EXT on hard disks
    //=========================================================================

    #[test]
    fn hard_disk_queries_and_slices() {
        let (mut cpu, mut machine) = machine();
        machine.hbios.hard_disks[0].open_memory(vec![0u8; 8_388_608]);

        call(&mut cpu, &mut machine, HBF_DIODEVICE, 0x02);
        assert_eq!(cpu.registers().get8(Reg8::D), 0x09);
        assert_eq!(cpu.registers().get8(Reg8::E), 0);
        assert_eq!(cpu.registers().get8(Reg8::C), 0x20); // high capacity

        call(&mut cpu, &mut machine, HBF_DIOMEDIA, 0x02);
        assert_eq!(cpu.registers().get8(Reg8::E), 0x0A); // MID_HDNEW

        // EXTSLICE slice 3 of a plain 8MB hd1k image
        cpu.registers().set8(Reg8::D, 0x02);
        cpu.registers().set8(Reg8::E, 3);
        call(&mut cpu, &mut machine, HBF_EXTSLICE, 0);
        assert_eq!(result_of(&mut cpu), ERR_NONE);
        assert_eq!(cpu.registers().get8(Reg8::C), 0x0A);
        assert_eq!(cpu.registers().get8(Reg8::B), 0x00);
        let lba = (cpu.registers().get16(Reg16::DE) as u32) << 16
            | cpu.registers().get16(Reg16::HL) as u32;
        assert_eq!(lba, 3 * 16384);
    }

    #[test]
    fn extslice_follows_the_mbr_partition() {
        let (mut cpu, mut machine) = machine();
        let mut image = vec![0u8; 9 * 1024 * 1024];
        image[510] = 0x55;
        image[511] = 0xAA;
        image[0x1BE + 4] = 0x2E;
        image[0x1BE + 8] = 0x00;
        image[0x1BE + 9] = 0x08; // LBA 2048
        machine.hbios.hard_disks[0].open_memory(image);

        cpu.registers().set8(Reg8::D, 0x02);
        cpu.registers().set8(Reg8::E, 0);
        call(&mut cpu, &mut machine, HBF_EXTSLICE, 0);
        assert_eq!(cpu.registers().get8(Reg8::C), 0x0A);
        let lba = (cpu.registers().get16(Reg16::DE) as u32) << 16
            | cpu.registers().get16(Reg16::HL) as u32;
        assert_eq!(lba, 2048);
    }

    #[test]
    fn extslice_is_stable_across_calls() {
        let (mut cpu, mut machine) = machine();
        machine.hbios.hard_disks[0].open_memory(vec![0u8; 8_519_680]);
        for _ in 0..2 {
            cpu.registers().set8(Reg8::D, 0x02);
            cpu.registers().set8(Reg8::E, 1);
            call(&mut cpu, &mut machine, HBF_EXTSLICE, 0);
            assert_eq!(cpu.registers().get8(Reg8::C), 0x04); // MID_HD
            let lba = (cpu.registers().get16(Reg16::DE) as u32) << 16
                | cpu.registers().get16(Reg16::HL) as u32;
            assert_eq!(lba, 16640);
        }
    }

    #[test]
    fn hard_disk_write_read_round_trip() {
        let (mut cpu, mut machine) = machine_with_mem_disks();
        machine.hbios.hard_disks[0].open_memory(vec![0u8; 8_388_608]);

        for i in 0..512u16 {
            machine.mem.store(0x9000 + i, (i * 7) as u8);
        }
        seek(&mut cpu, &mut machine, 0x02, 100);
        cpu.registers().set16(Reg16::HL, 0x9000);
        cpu.registers().set8(Reg8::D, 0x00);
        cpu.registers().set8(Reg8::E, 1);
        call(&mut cpu, &mut machine, HBF_DIOWRITE, 0x02);
        assert_eq!(cpu.registers().get8(Reg8::E), 1);
        assert_eq!(machine.hbios.hard_disks[0].current_lba, 101);

        seek(&mut cpu, &mut machine, 0x02, 100);
        cpu.registers().set16(Reg16::HL, 0xA800);
        cpu.registers().set8(Reg8::D, 0x00);
        cpu.registers().set8(Reg8::E, 1);
        call(&mut cpu, &mut machine, HBF_DIOREAD, 0x02);
        assert_eq!(cpu.registers().get8(Reg8::E), 1);
        for i in 0..512u16 {
            assert_eq!(machine.mem.fetch(0xA800 + i), (i * 7) as u8);
        }
    }

    //=========================================================================
    // SYS
    //=========================================================================

    #[test]
    fn sysver_reports_version_and_platform() {
        let (mut cpu, mut machine) = machine();
        call(&mut cpu, &mut machine, HBF_SYSVER, 0);
        assert_eq!(cpu.registers().get16(Reg16::DE), 0x3510);
        assert_eq!(cpu.registers().get8(Reg8::L), 0x01);
        assert_eq!(cpu.registers().pc(), RET_ADDR);
    }

    #[test]
    fn sysalloc_bumps_and_exhausts() {
        let (mut cpu, mut machine) = machine();
        cpu.registers().set16(Reg16::HL, 0x0100);
        call(&mut cpu, &mut machine, HBF_SYSALLOC, 0);
        assert_eq!(cpu.registers().get16(Reg16::HL), 0x0200);
        assert!(cpu.registers().get_flag(Flag::Z));

        cpu.registers().set16(Reg16::HL, 0x0040);
        call(&mut cpu, &mut machine, HBF_SYSALLOC, 0);
        assert_eq!(cpu.registers().get16(Reg16::HL), 0x0300);

        // Exhaustion: more than the heap can hold
        cpu.registers().set16(Reg16::HL, 0x8000);
        call(&mut cpu, &mut machine, HBF_SYSALLOC, 0);
        assert_eq!(cpu.registers().get16(Reg16::HL), 0x0000);
        assert_eq!(result_of(&mut cpu), ERR_NOMEM);
        assert!(cpu.registers().get_flag(Flag::C));
        assert!(!cpu.registers().get_flag(Flag::Z));

        // SYSFREE is a no-op; the next allocation continues from the bump
        cpu.registers().set16(Reg16::HL, 0x0340);
        call(&mut cpu, &mut machine, HBF_SYSFREE, 0);
        assert_eq!(result_of(&mut cpu), ERR_NONE);
        cpu.registers().set16(Reg16::HL, 0x0010);
        call(&mut cpu, &mut machine, HBF_SYSALLOC, 0);
        assert_eq!(cpu.registers().get16(Reg16::HL), 0x0340);
    }

    #[test]
    fn syssetbnk_initializes_ram_banks_once() {
        let (mut cpu, mut machine) = machine();
        machine.mem.patch_rom(0x0008, 0xC3); // RST 08 vector
        machine.mem.patch_rom(0x0112, 0xFF); // APITYPE as shipped (UNA)
        machine.mem.patch_rom(0x0150, 0x77); // some HCB content

        call(&mut cpu, &mut machine, HBF_SYSSETBNK, 0x82);
        assert_eq!(cpu.registers().get8(Reg8::C), 0x00); // previous bank
        assert_eq!(machine.mem.current_bank(), 0x82);
        assert_eq!(machine.mem.read_bank(0x82, 0x0008), 0xC3);
        assert_eq!(machine.mem.read_bank(0x82, 0x0150), 0x77);
        assert_eq!(machine.mem.read_bank(0x82, 0x0112), 0x00); // patched
        // Outside the copied range the bank is untouched
        assert_eq!(machine.mem.read_bank(0x82, 0x0200), 0x00);

        // Initialization happens once: guest data survives reselection
        machine.mem.write_bank(0x82, 0x0150, 0x11);
        call(&mut cpu, &mut machine, HBF_SYSSETBNK, 0x80);
        call(&mut cpu, &mut machine, HBF_SYSSETBNK, 0x82);
        assert_eq!(cpu.registers().get8(Reg8::C), 0x80);
        assert_eq!(machine.mem.read_bank(0x82, 0x0150), 0x11);
    }

    #[test]
    fn sysgetbnk_reports_current_bank() {
        let (mut cpu, mut machine) = machine();
        machine.mem.select_bank(0x8E);
        call(&mut cpu, &mut machine, HBF_SYSGETBNK, 0);
        assert_eq!(cpu.registers().get8(Reg8::L), 0x8E);
    }

    #[test]
    fn bank_copy_with_common_substitution() {
        let (mut cpu, mut machine) = machine();
        for i in 0..16u16 {
            machine.mem.write_bank(0x81, 0x1000 + i, 0x40 + i as u8);
        }

        // SYSSETCPY: D = dst bank, E = src bank, HL = count
        cpu.registers().set8(Reg8::D, 0x82);
        cpu.registers().set8(Reg8::E, 0x81);
        cpu.registers().set16(Reg16::HL, 16);
        call(&mut cpu, &mut machine, HBF_SYSSETCPY, 0);

        // SYSBNKCPY: HL = src addr, DE = dst addr
        cpu.registers().set16(Reg16::HL, 0x1000);
        cpu.registers().set16(Reg16::DE, 0x2000);
        call(&mut cpu, &mut machine, HBF_SYSBNKCPY, 0);
        for i in 0..16u16 {
            assert_eq!(machine.mem.read_bank(0x82, 0x2000 + i), 0x40 + i as u8);
        }

        // Destination above 0x8000 lands in the common bank
        cpu.registers().set8(Reg8::D, 0x82);
        cpu.registers().set8(Reg8::E, 0x81);
        cpu.registers().set16(Reg16::HL, 4);
        call(&mut cpu, &mut machine, HBF_SYSSETCPY, 0);
        cpu.registers().set16(Reg16::HL, 0x1000);
        cpu.registers().set16(Reg16::DE, 0x9000);
        call(&mut cpu, &mut machine, HBF_SYSBNKCPY, 0);
        for i in 0..4u16 {
            assert_eq!(machine.mem.fetch(0x9000 + i), 0x40 + i as u8);
            assert_eq!(machine.mem.read_bank(COMMON_BANK, 0x1000 + i), 0x40 + i as u8);
        }
    }

    #[test]
    fn syspeek_and_syspoke() {
        let (mut cpu, mut machine) = machine();

        cpu.registers().set8(Reg8::D, 0x83);
        cpu.registers().set8(Reg8::E, 0x99);
        cpu.registers().set16(Reg16::HL, 0x1234);
        call(&mut cpu, &mut machine, HBF_SYSPOKE, 0);
        assert_eq!(machine.mem.read_bank(0x83, 0x1234), 0x99);

        cpu.registers().set8(Reg8::D, 0x83);
        cpu.registers().set8(Reg8::E, 0x00);
        cpu.registers().set16(Reg16::HL, 0x1234);
        call(&mut cpu, &mut machine, HBF_SYSPEEK, 0);
        assert_eq!(cpu.registers().get8(Reg8::E), 0x99);

        // Addresses in the common window use the CPU-visible mapping
        machine.mem.store(0x9abc, 0x42);
        cpu.registers().set8(Reg8::D, 0x00);
        cpu.registers().set16(Reg16::HL, 0x9abc);
        call(&mut cpu, &mut machine, HBF_SYSPEEK, 0);
        assert_eq!(cpu.registers().get8(Reg8::E), 0x42);
    }

    #[test]
    fn sysget_counts_and_info() {
        let (mut cpu, mut machine) = machine_with_mem_disks();
        machine.hbios.hard_disks[2].open_memory(vec![0u8; 8_388_608]);

        call(&mut cpu, &mut machine, HBF_SYSGET, SYSGET_DIOCNT);
        assert_eq!(cpu.registers().get8(Reg8::E), 3); // MD0 + MD1 + HD2

        call(&mut cpu, &mut machine, HBF_SYSGET, SYSGET_CIOCNT);
        assert_eq!(cpu.registers().get8(Reg8::E), 1);
        call(&mut cpu, &mut machine, HBF_SYSGET, SYSGET_DSKYCNT);
        assert_eq!(cpu.registers().get8(Reg8::E), 0);

        call(&mut cpu, &mut machine, HBF_SYSGET, SYSGET_CPUINFO);
        assert_eq!(cpu.registers().get16(Reg16::DE), 0x0004);
        assert_eq!(cpu.registers().get16(Reg16::HL), 4000);

        call(&mut cpu, &mut machine, HBF_SYSGET, SYSGET_MEMINFO);
        assert_eq!(cpu.registers().get8(Reg8::D), 16);
        assert_eq!(cpu.registers().get8(Reg8::E), 16);

        call(&mut cpu, &mut machine, HBF_SYSGET, SYSGET_BNKINFO);
        assert_eq!(cpu.registers().get8(Reg8::D), 0x80);
        assert_eq!(cpu.registers().get8(Reg8::E), 0x8E);

        call(&mut cpu, &mut machine, HBF_SYSGET, SYSGET_CPUSPD);
        assert_eq!(cpu.registers().get8(Reg8::H), 0);
        assert_eq!(cpu.registers().get8(Reg8::L), 1);
    }

    #[test]
    fn sysreset_warm_defers_to_the_outer_loop() {
        let (mut cpu, mut machine) = machine();
        machine.hbios.signal_byte(0xFF);
        call(&mut cpu, &mut machine, HBF_SYSRESET, 0x01);
        assert_eq!(machine.hbios.pending_reset, Some(0x01));

        machine.reset_guest();
        assert!(!machine.hbios.trapping_enabled);
        assert_eq!(machine.mem.current_bank(), 0x00);

        // Subtype 0: plain success, no restart
        machine.hbios.signal_byte(0xFF);
        call(&mut cpu, &mut machine, HBF_SYSRESET, 0x00);
        assert_eq!(machine.hbios.pending_reset, None);
        assert_eq!(result_of(&mut cpu), ERR_NONE);
    }

    //=========================================================================
    // RTC / VDA / SND / DSKY
    //=========================================================================

    #[test]
    fn rtcgettim_writes_six_bcd_bytes() {
        let (mut cpu, mut machine) = machine();
        cpu.registers().set16(Reg16::HL, 0x9000);
        call(&mut cpu, &mut machine, HBF_RTCGETTIM, 0);
        assert_eq!(result_of(&mut cpu), ERR_NONE);

        let unbcd = |b: u8| (b >> 4) * 10 + (b & 0x0F);
        let month = unbcd(machine.mem.fetch(0x9001));
        let day = unbcd(machine.mem.fetch(0x9002));
        let hour = unbcd(machine.mem.fetch(0x9003));
        let minute = unbcd(machine.mem.fetch(0x9004));
        let second = unbcd(machine.mem.fetch(0x9005));
        assert!(unbcd(machine.mem.fetch(0x9000)) < 100);
        assert!((1..=12).contains(&month));
        assert!((1..=31).contains(&day));
        assert!(hour < 24 && minute < 60 && second < 60);
    }

    #[test]
    fn vda_query_and_cursor() {
        let (mut cpu, mut machine) = machine();
        call(&mut cpu, &mut machine, HBF_VDAQRY, 0);
        assert_eq!(cpu.registers().get8(Reg8::D), 80);
        assert_eq!(cpu.registers().get8(Reg8::E), 25);

        cpu.registers().set8(Reg8::D, 5);
        cpu.registers().set8(Reg8::E, 10);
        call(&mut cpu, &mut machine, HBF_VDASCP, 0);

        cpu.registers().set8(Reg8::D, 0x0F);
        cpu.registers().set8(Reg8::E, 0x01);
        call(&mut cpu, &mut machine, HBF_VDASCO, 0);

        call(&mut cpu, &mut machine, HBF_VDARDC, 0);
        assert_eq!(cpu.registers().get8(Reg8::E), b' ');

        call(&mut cpu, &mut machine, HBF_VDAKST, 0);
        assert_eq!(cpu.registers().get8(Reg8::E), 0x00);
        machine.console.queue_char(b'k');
        call(&mut cpu, &mut machine, HBF_VDAKST, 0);
        assert_eq!(cpu.registers().get8(Reg8::E), 0xFF);

        call(&mut cpu, &mut machine, HBF_VDAKRD, 0);
        assert_eq!(cpu.registers().get8(Reg8::E), b'k');
    }

    #[test]
    fn snd_note_and_query() {
        let (mut cpu, mut machine) = machine();
        // A440 (MIDI 69) is a period of 2272 microseconds
        cpu.registers().set8(Reg8::E, 69);
        call(&mut cpu, &mut machine, HBF_SNDNOTE, 0);
        assert_eq!(machine.hbios.snd_period[0], 2272);

        call(&mut cpu, &mut machine, HBF_SNDQUERY, 0);
        assert_eq!(cpu.registers().get16(Reg16::DE), 0x0001);
    }

    #[test]
    fn dsky_reports_no_hardware() {
        let (mut cpu, mut machine) = machine();
        for func in [0x30u8, 0x32, 0x37, 0x3A].iter() {
            call(&mut cpu, &mut machine, *func, 0);
            assert_eq!(result_of(&mut cpu), ERR_NOHW);
            assert!(cpu.registers().get_flag(Flag::C));
        }
    }

    //=========================================================================
    // EXT host files
    //=========================================================================

    #[test]
    fn host_getarg_copies_tokens() {
        let (mut cpu, mut machine) = machine();
        machine.hbios.host_cmd_line = "alpha beta  gamma".to_string();

        // E doubles as the token index and the buffer address low byte
        cpu.registers().set16(Reg16::DE, 0x9000);
        call(&mut cpu, &mut machine, HBF_HOST_GETARG, 0);
        assert_eq!(result_of(&mut cpu), ERR_NONE);
        let read_str = |machine: &RomwbwMachine, mut addr: u16| {
            let mut s = String::new();
            loop {
                let b = machine.mem.fetch(addr);
                if b == 0 {
                    break;
                }
                s.push(b as char);
                addr += 1;
            }
            s
        };
        assert_eq!(read_str(&machine, 0x9000), "alpha");

        cpu.registers().set16(Reg16::DE, 0x9102);
        call(&mut cpu, &mut machine, HBF_HOST_GETARG, 0);
        assert_eq!(read_str(&machine, 0x9102), "gamma");

        cpu.registers().set16(Reg16::DE, 0x9205);
        call(&mut cpu, &mut machine, HBF_HOST_GETARG, 0);
        assert_eq!(result_of(&mut cpu), ERR_FAILED);
    }

    #[test]
    fn host_mode_get_and_set() {
        let (mut cpu, mut machine) = machine();
        cpu.registers().set8(Reg8::E, 2);
        call(&mut cpu, &mut machine, HBF_HOST_MODE, 1);
        cpu.registers().set8(Reg8::E, 0xAA);
        call(&mut cpu, &mut machine, HBF_HOST_MODE, 0);
        assert_eq!(cpu.registers().get8(Reg8::E), 2);
    }

    #[test]
    fn host_read_without_open_file_fails() {
        let (mut cpu, mut machine) = machine();
        call(&mut cpu, &mut machine, HBF_HOST_READ, 0);
        assert_eq!(result_of(&mut cpu), ERR_FAILED);
        call(&mut cpu, &mut machine, HBF_HOST_WRITE, 0);
        assert_eq!(result_of(&mut cpu), ERR_FAILED);
    }

    //=========================================================================
    // Port-level flows
    //=========================================================================

    #[test]
    fn signal_port_enables_trapping_end_to_end() {
        let (_, mut machine) = machine();
        machine.port_out(0xEE, 0x01);
        machine.port_out(0xEE, 0xFF);
        assert!(machine.hbios.trapping_enabled);
        assert_eq!(machine.hbios.main_entry, 0xFFF0);
        assert!(!machine.hbios.waiting_for_input);
    }

    #[test]
    fn bank_select_port_initializes_ram_banks() {
        let (_, mut machine) = machine();
        machine.mem.patch_rom(0x0112, 0xFF);
        machine.mem.patch_rom(0x0042, 0x8A);
        machine.port_out(0x78, 0x85);
        assert_eq!(machine.mem.current_bank(), 0x85);
        assert_eq!(machine.mem.read_bank(0x85, 0x0042), 0x8A);
        assert_eq!(machine.mem.read_bank(0x85, 0x0112), 0x00);
        // The read alias reports the selection
        assert_eq!(machine.port_in(0x7C), 0x85);
    }

    #[test]
    fn dispatch_port_skips_the_synthetic_return() {
        let (mut cpu, mut machine) = machine();
        machine.hbios.signal_byte(0xFF);
        cpu.registers().set_pc(0x4002); // just past the OUT in the proxy
        cpu.registers().set8(Reg8::B, HBF_CIOOST);
        cpu.registers().set8(Reg8::C, 0);
        machine.port_out(0xEF, 0x00);
        let request = machine.pending.take().unwrap();
        assert_eq!(request, PortRequest::Dispatch);
        machine.handle_port_request(&mut cpu, request);
        assert_eq!(cpu.registers().get8(Reg8::E), 0xFF);
        assert_eq!(result_of(&mut cpu), ERR_NONE);
        // No pop: the proxy's own RET runs next
        assert_eq!(cpu.registers().pc(), 0x4002);
        assert_eq!(cpu.registers().get16(Reg16::SP), 0xFF80);
    }

    #[test]
    fn bank_copy_port_uses_parameter_cells() {
        let (mut cpu, mut machine) = machine();
        for i in 0..8u16 {
            machine.mem.write_bank(0x83, 0x3000 + i, 0x60 + i as u8);
        }
        machine.mem.store(0xFFE4, 0x83); // source bank cell
        machine.mem.store(0xFFE7, 0x84); // destination bank cell
        cpu.registers().set16(Reg16::HL, 0x3000);
        cpu.registers().set16(Reg16::DE, 0x0100);
        cpu.registers().set16(Reg16::BC, 8);
        machine.port_out(0xEC, 0x00);
        let request = machine.pending.take().unwrap();
        machine.handle_port_request(&mut cpu, request);
        for i in 0..8u16 {
            assert_eq!(machine.mem.read_bank(0x84, 0x0100 + i), 0x60 + i as u8);
        }
    }

    #[test]
    fn unknown_ports_count_in_lenient_mode_and_halt_in_strict() {
        let (_, mut machine) = machine();
        assert_eq!(machine.port_in(0x55), 0xFF);
        machine.port_out(0x55, 0x01);
        assert_eq!(machine.unknown_port_hits(), 2);
        assert!(machine.io_fault.is_none());

        machine.strict_io = true;
        machine.port_out(0x55, 0x01);
        assert!(machine.io_fault.is_some());
    }

    //=========================================================================
    // Boot
    //=========================================================================

    /// Lay a bootable image into the RAM disk banks: header at 0x5E0,
    /// payload at 0x600.
    fn install_md0_image(machine: &mut RomwbwMachine, load: u16, entry: u16, payload: &[u8]) {
        let end = load + payload.len() as u16;
        let header: [u8; 6] = [
            (load & 0xFF) as u8,
            (load >> 8) as u8,
            (end & 0xFF) as u8,
            (end >> 8) as u8,
            (entry & 0xFF) as u8,
            (entry >> 8) as u8,
        ];
        for (i, &b) in header.iter().enumerate() {
            machine.mem.write_bank(0x81, 0x05E0 + 26 + i as u16, b);
        }
        for (i, &b) in payload.iter().enumerate() {
            machine.mem.write_bank(0x81, 0x0600 + i as u16, b);
        }
    }

    #[test]
    fn boot_from_memory_disk() {
        let (mut cpu, mut machine) = machine_with_mem_disks();
        let payload: Vec<u8> = (0..600).map(|i| (i % 251) as u8).collect();
        install_md0_image(&mut machine, 0xC000, 0xC123, &payload);

        let RomwbwMachine { mem, hbios, .. } = &mut machine;
        hbios.boot_from_command("MD0", &mut cpu, mem).unwrap();

        assert_eq!(cpu.registers().pc(), 0xC123);
        assert_eq!(cpu.registers().get8(Reg8::D), 0);
        assert_eq!(cpu.registers().get8(Reg8::E), 0);
        for (i, &b) in payload.iter().enumerate() {
            assert_eq!(machine.mem.fetch(0xC000 + i as u16), b);
        }
    }

    #[test]
    fn empty_boot_command_picks_the_first_memory_disk() {
        let (mut cpu, mut machine) = machine_with_mem_disks();
        install_md0_image(&mut machine, 0xD000, 0xD000, &[0xAA, 0xBB]);
        let RomwbwMachine { mem, hbios, .. } = &mut machine;
        hbios.boot_from_command("", &mut cpu, mem).unwrap();
        assert_eq!(cpu.registers().pc(), 0xD000);
        assert_eq!(machine.mem.fetch(0xD000), 0xAA);
        assert_eq!(machine.mem.fetch(0xD001), 0xBB);
    }

    #[test]
    fn boot_from_hard_disk_slice() {
        let (mut cpu, mut machine) = machine();
        // Slice 1 of a plain 8MB hd1k image starts at LBA 16384
        let mut image = vec![0u8; 8_388_608];
        let base = 16384usize * 512;
        let load = 0x8000u16;
        let end = 0x8004u16;
        let entry = 0x8002u16;
        image[base + 0x5E0 + 26] = (load & 0xFF) as u8;
        image[base + 0x5E0 + 27] = (load >> 8) as u8;
        image[base + 0x5E0 + 28] = (end & 0xFF) as u8;
        image[base + 0x5E0 + 29] = (end >> 8) as u8;
        image[base + 0x5E0 + 30] = (entry & 0xFF) as u8;
        image[base + 0x5E0 + 31] = (entry >> 8) as u8;
        image[base + 0x600..base + 0x604].copy_from_slice(&[1, 2, 3, 4]);
        machine.hbios.hard_disks[0].open_memory(image);

        let RomwbwMachine { mem, hbios, .. } = &mut machine;
        hbios.boot_from_command("HD0:1", &mut cpu, mem).unwrap();

        assert_eq!(cpu.registers().pc(), 0x8002);
        assert_eq!(cpu.registers().get8(Reg8::D), 2); // guest unit of HD0
        assert_eq!(machine.mem.fetch(0x8000), 1);
        assert_eq!(machine.mem.fetch(0x8003), 4);
    }

    #[test]
    fn boot_from_missing_unit_fails() {
        let (mut cpu, mut machine) = machine();
        let RomwbwMachine { mem, hbios, .. } = &mut machine;
        let err = hbios.boot_from_command("MD1:0", &mut cpu, mem).unwrap_err();
        assert!(err.contains("no unit"), "unexpected error: {}", err);
        let err = hbios.boot_from_command("HD3", &mut cpu, mem).unwrap_err();
        assert!(err.contains("no unit"), "unexpected error: {}", err);
        let err = hbios.boot_from_command("", &mut cpu, mem).unwrap_err();
        assert!(err.contains("no bootable"), "unexpected error: {}", err);
    }

    #[test]
    fn sysboot_reads_the_command_from_guest_memory() {
        let (mut cpu, mut machine) = machine_with_mem_disks();
        install_md0_image(&mut machine, 0xE000, 0xE000, &[0x55]);
        for (i, b) in b"MD0\r".iter().enumerate() {
            machine.mem.store(0x9300 + i as u16, *b);
        }
        cpu.registers().set16(Reg16::HL, 0x9300);
        call(&mut cpu, &mut machine, HBF_SYSBOOT, 0);
        assert_eq!(cpu.registers().pc(), 0xE000);
        assert_eq!(machine.mem.fetch(0xE000), 0x55);
    }

    #[test]
    fn rom_app_lookup_is_case_insensitive() {
        let (_, mut machine) = machine();
        machine.hbios.rom_apps.push(RomApp {
            key: 'C',
            name: "CP/M 2.2".to_string(),
            path: "nonexistent.sys".to_string(),
        });
        assert_eq!(machine.hbios.find_rom_app('c'), Some(0));
        assert_eq!(machine.hbios.find_rom_app('C'), Some(0));
        assert_eq!(machine.hbios.find_rom_app('Z'), None);
    }

    //=========================================================================
    // HCB population
    //=========================================================================

    #[test]
    fn hcb_tables_cover_attached_devices() {
        let (_, mut machine) = machine();
        machine.mem.patch_rom(0x01DC, 0x81);
        machine.mem.patch_rom(0x01DD, 2);
        machine.hbios.hard_disks[0].open_memory(vec![0u8; 8_388_608]);
        machine.post_rom_setup();

        // DISKUT: MD0 entry then the hard disk entry
        assert_eq!(machine.mem.read_bank(0x80, 0x0160), 0x00); // MD class
        assert_eq!(machine.mem.read_bank(0x80, 0x0161), 0);
        assert_eq!(machine.mem.read_bank(0x80, 0x0164), 0x09); // HDSK class
        assert_eq!(machine.mem.read_bank(0x80, 0x0165), 0);
        assert_eq!(machine.mem.read_bank(0x80, 0x0168), 0xFF); // empty

        // DRVMAP: A: = MD0, then 4 slices of HD0 as unit 2
        assert_eq!(machine.mem.read_bank(0x80, 0x0120), 0x00);
        assert_eq!(machine.mem.read_bank(0x80, 0x0121), 0x02);
        assert_eq!(machine.mem.read_bank(0x80, 0x0122), 0x12);
        assert_eq!(machine.mem.read_bank(0x80, 0x0123), 0x22);
        assert_eq!(machine.mem.read_bank(0x80, 0x0124), 0x32);
        assert_eq!(machine.mem.read_bank(0x80, 0x0125), 0xFF);

        // DEVCNT counts the assigned drive letters
        assert_eq!(machine.mem.read_bank(0x80, 0x010C), 5);

        // The ident block is in place and the APITYPE patch took
        assert_eq!(machine.mem.fetch(0xFE00), b'W');
        assert_eq!(machine.mem.fetch(0xFFFD), 0xFF);
        assert_eq!(machine.mem.read_bank(0x00, 0x0112), 0x00);
    }
}
