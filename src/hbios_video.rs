use iz80::*;

use crate::banked_memory::BankedMemory;
use crate::console::Console;
use crate::hbios::*;

const BEL: u8 = 0x07;

impl Hbios {
    //=========================================================================
    // Video display adapter (VDA)
    //=========================================================================

    /// The VDA is a cursor/attribute model over the console sink: the
    /// emulator tracks position and attribute, the sink renders. Scroll
    /// requests are forwarded as-is (the plain terminal sink scrolls
    /// naturally on newline).
    pub fn handle_vda(&mut self, cpu: &mut Cpu, mem: &mut BankedMemory, console: &mut Console) {
        let func = cpu.registers().get8(Reg8::B);
        let mut result = ERR_NONE;

        match func {
            HBF_VDAINI | HBF_VDARES => {
                self.vda_cursor_row = 0;
                self.vda_cursor_col = 0;
                self.vda_attr = 0x07;
            }

            HBF_VDAQRY => {
                cpu.registers().set8(Reg8::D, self.vda_cols);
                cpu.registers().set8(Reg8::E, self.vda_rows);
            }

            HBF_VDASCP => {
                self.vda_cursor_row = cpu.registers().get8(Reg8::D);
                self.vda_cursor_col = cpu.registers().get8(Reg8::E);
            }

            HBF_VDASAT => {
                self.vda_attr = cpu.registers().get8(Reg8::E);
            }

            HBF_VDASCO => {
                // D = foreground, E = background, CGA 16-color style
                let fg = cpu.registers().get8(Reg8::D);
                let bg = cpu.registers().get8(Reg8::E);
                self.vda_attr = (bg << 4) | (fg & 0x0F);
            }

            HBF_VDAWRC => {
                let ch = cpu.registers().get8(Reg8::E);
                self.vda_put_char(console, ch);
            }

            HBF_VDAFIL => {
                let ch = cpu.registers().get8(Reg8::E);
                let count = cpu.registers().get16(Reg16::HL);
                for _ in 0..count {
                    self.vda_put_char(console, ch);
                }
            }

            HBF_VDASCR => {
                let lines = cpu.registers().get8(Reg8::E);
                for _ in 0..lines {
                    console.write_str("\r\n");
                }
            }

            HBF_VDAKST => {
                let pending = if console.has_input() { 0xFF } else { 0x00 };
                cpu.registers().set8(Reg8::E, pending);
            }

            HBF_VDAKRD => {
                if !self.console_read_into_e(cpu, console) {
                    return;
                }
            }

            HBF_VDARDC => {
                // Character under the cursor is not tracked
                cpu.registers().set8(Reg8::E, b' ');
            }

            _ => {
                if self.debug {
                    eprintln!("[HBIOS VDA] Unhandled function 0x{:02X}", func);
                }
                result = ERR_NOFUNC;
            }
        }

        self.set_result(cpu, result);
        self.do_ret(cpu, mem);
    }

    /// Write one character, advance the cursor, wrap at the right edge
    /// and scroll when running off the bottom row.
    fn vda_put_char(&mut self, console: &mut Console, ch: u8) {
        console.write_char(ch);
        self.vda_cursor_col += 1;
        if self.vda_cursor_col >= self.vda_cols {
            self.vda_cursor_col = 0;
            self.vda_cursor_row += 1;
            if self.vda_cursor_row >= self.vda_rows {
                self.vda_cursor_row = self.vda_rows - 1;
            }
        }
    }

    //=========================================================================
    // Sound (SND)
    //=========================================================================

    pub fn handle_snd(&mut self, cpu: &mut Cpu, mem: &mut BankedMemory, console: &mut Console) {
        let func = cpu.registers().get8(Reg8::B);
        let channel = cpu.registers().get8(Reg8::C) as usize;
        let mut result = ERR_NONE;

        match func {
            HBF_SNDRESET => {
                self.snd_volume = [0; 4];
                self.snd_period = [0; 4];
                self.snd_duration = 100;
            }

            HBF_SNDVOL => {
                if channel < 4 {
                    self.snd_volume[channel] = cpu.registers().get8(Reg8::E);
                }
            }

            HBF_SNDPRD => {
                if channel < 4 {
                    self.snd_period[channel] = cpu.registers().get16(Reg16::DE);
                }
            }

            HBF_SNDNOTE => {
                // MIDI-style note number to a period in microseconds:
                // freq = 440 * 2^((note-69)/12), period = 1e6 / freq
                let note = cpu.registers().get8(Reg8::E);
                if channel < 4 && note > 0 {
                    let freq = 440.0 * f64::powf(2.0, (note as f64 - 69.0) / 12.0);
                    self.snd_period[channel] = (1_000_000.0 / freq) as u16;
                }
            }

            HBF_SNDDUR => {
                self.snd_duration = cpu.registers().get16(Reg16::DE);
            }

            HBF_SNDPLAY => {
                // Single output channel; audible only when channel 0
                // has both a pitch and a volume
                if self.snd_period[0] > 0 && self.snd_volume[0] > 0 {
                    console.write_char(BEL);
                }
            }

            HBF_SNDBEEP => {
                // Fixed 100 ms beep
                console.write_char(BEL);
            }

            HBF_SNDQUERY => {
                cpu.registers().set16(Reg16::DE, 0x0001);
            }

            _ => {
                if self.debug {
                    eprintln!("[HBIOS SND] Unhandled function 0x{:02X}", func);
                }
                result = ERR_NOFUNC;
            }
        }

        self.set_result(cpu, result);
        self.do_ret(cpu, mem);
    }

    //=========================================================================
    // DSKY (display/keypad)
    //=========================================================================

    /// No DSKY hardware is emulated; every function answers "no
    /// hardware" and the guest falls back to the console.
    pub fn handle_dsky(&mut self, cpu: &mut Cpu, mem: &mut BankedMemory) {
        let func = cpu.registers().get8(Reg8::B);
        if self.debug {
            eprintln!("[HBIOS DSKY] Function 0x{:02X} -> no hardware", func);
        }
        self.set_result(cpu, ERR_NOHW);
        self.do_ret(cpu, mem);
    }
}
