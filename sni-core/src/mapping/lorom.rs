//! LoROM mapping between the flat FX Pak Pro address space and the SNES A bus.
//!
//! Pak space layout:
//! - `$000000-$DFFFFF`: ROM image, mirrored every `$400000`
//! - `$E00000-$EFFFFF`: SRAM, 16 banks of `$8000`, mirrored every `$80000`
//! - `$F50000-$F6FFFF`: WRAM, mirrored every `$20000` up to `$FFFFFF`

use crate::error::{SniError, SniResult};

pub const ROM_END: u32 = 0xE0_0000;
pub const ROM_MIRROR: u32 = 0x40_0000;

pub const SRAM_START: u32 = 0xE0_0000;
pub const SRAM_END: u32 = 0xF0_0000;
pub const SRAM_MIRROR: u32 = 0x8_0000;
pub const SRAM_BANK_SIZE: u32 = 0x8000;

pub const WRAM_START: u32 = 0xF5_0000;
pub const WRAM_MIRROR: u32 = 0x2_0000;
pub const WRAM_SIZE: u32 = 0x2_0000;

const BUS_ROM_BASE: u32 = 0x80_0000;
const BUS_SRAM_BANK: u32 = 0xF0;
const BUS_WRAM_BANK: u32 = 0x7E;

/// Translate a pak address to its canonical bus address.
///
/// Addresses outside the ROM, SRAM and WRAM windows are returned unchanged.
pub fn pak_to_bus(pak: u32) -> u32 {
    if pak < ROM_END {
        let rom = pak % ROM_MIRROR;
        BUS_ROM_BASE | ((rom & 0x3F_8000) << 1) | 0x8000 | (rom & 0x7FFF)
    } else if pak < SRAM_END {
        let offset = (pak - SRAM_START) % SRAM_MIRROR;
        let bank = BUS_SRAM_BANK + offset / SRAM_BANK_SIZE;
        (bank << 16) | (offset % SRAM_BANK_SIZE)
    } else if (WRAM_START..=0xFF_FFFF).contains(&pak) {
        let offset = (pak - WRAM_START) % WRAM_MIRROR;
        let bank = BUS_WRAM_BANK + (offset >> 16);
        (bank << 16) | (offset & 0xFFFF)
    } else {
        pak
    }
}

/// Translate a bus address to the pak address backing it.
///
/// Fails for bus locations with no pak counterpart, e.g. hardware registers,
/// and for anything past the 24-bit bus.
pub fn bus_to_pak(bus: u32) -> SniResult<u32> {
    if bus > 0xFF_FFFF {
        return Err(SniError::UnmappedAddress(bus));
    }
    let bank = bus >> 16;
    let offset = bus & 0xFFFF;
    let low_bank = bank & 0x7F;

    if bank == 0x7E || bank == 0x7F {
        return Ok(WRAM_START + ((bank - BUS_WRAM_BANK) << 16) + offset);
    }
    if low_bank < 0x40 && offset < 0x2000 {
        // low RAM mirror of the first WRAM page
        return Ok(WRAM_START + offset);
    }
    if offset >= 0x8000 {
        return Ok((low_bank << 15) | (offset & 0x7FFF));
    }
    if (0x70..=0x7D).contains(&bank) || bank >= 0xF0 {
        return Ok(SRAM_START + (bank & 0x0F) * SRAM_BANK_SIZE + offset);
    }
    if (0x40..=0x6F).contains(&low_bank) {
        return Ok((low_bank << 15) | offset);
    }

    Err(SniError::UnmappedAddress(bus))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pak_to_bus_table() {
        let cases: &[(&str, u32, u32)] = &[
            // ROM header shadows
            ("ROM header bank $00", 0x007FC0, 0x80FFC0),
            ("ROM header bank $40", 0x407FC0, 0x80FFC0),
            ("ROM header bank $80", 0x807FC0, 0x80FFC0),
            ("ROM header bank $C0", 0xC07FC0, 0x80FFC0),
            // ROM last page
            ("ROM last page bank $00", 0x3FFFFF, 0xFFFFFF),
            ("ROM last page bank $40", 0x7FFFFF, 0xFFFFFF),
            ("ROM last page bank $80", 0xBFFFFF, 0xFFFFFF),
            ("ROM last page bank $C0", 0xDFFFFF, 0xBFFFFF),
            // SRAM
            ("SRAM $0 bank", 0xE00000, 0xF00000),
            ("SRAM $0 bank last byte", 0xE07FFF, 0xF07FFF),
            ("SRAM $1 bank first byte", 0xE08000, 0xF10000),
            ("SRAM $D bank first byte", 0xE68000, 0xFD0000),
            ("SRAM $D bank last byte", 0xE6FFFF, 0xFD7FFF),
            ("SRAM $E bank", 0xE70000, 0xFE0000),
            ("SRAM $F bank", 0xE78000, 0xFF0000),
            // SRAM mirror
            ("SRAM mirror $0 bank", 0xE80000, 0xF00000),
            ("SRAM mirror $0 bank last byte", 0xE87FFF, 0xF07FFF),
            ("SRAM mirror $1 bank first byte", 0xE88000, 0xF10000),
            ("SRAM mirror $D bank first byte", 0xEE8000, 0xFD0000),
            ("SRAM mirror $D bank last byte", 0xEEFFFF, 0xFD7FFF),
            ("SRAM mirror $E bank", 0xEF0000, 0xFE0000),
            ("SRAM mirror $F bank", 0xEF8000, 0xFF0000),
            // WRAM
            ("WRAM $00000", 0xF50000, 0x7E0000),
            ("WRAM $01000", 0xF51000, 0x7E1000),
            ("WRAM $02000", 0xF52000, 0x7E2000),
            ("WRAM $0FFFF", 0xF5FFFF, 0x7EFFFF),
            ("WRAM $10000", 0xF60000, 0x7F0000),
            ("WRAM $1FFFF", 0xF6FFFF, 0x7FFFFF),
            // WRAM mirrors
            ("WRAM mirror 1", 0xF70000, 0x7E0000),
            ("WRAM mirror 2", 0xF90000, 0x7E0000),
            ("WRAM mirror 3", 0xFB0000, 0x7E0000),
            ("WRAM mirror 4", 0xFD0000, 0x7E0000),
            ("WRAM mirror 5", 0xFF0000, 0x7E0000),
        ];

        for (name, pak, want) in cases {
            let got = pak_to_bus(*pak);
            assert_eq!(got, *want, "{}: pak_to_bus(${:06X}) = ${:06X}", name, pak, got);
        }
    }

    #[test]
    fn test_rom_header_alias_every_mirror() {
        for base in [0x00u32, 0x40, 0x80, 0xC0] {
            assert_eq!(pak_to_bus((base << 16) + 0x7FC0), 0x80FFC0);
        }
    }

    #[test]
    fn test_wram_mirror_bases() {
        for base in [0xF5u32, 0xF7, 0xF9, 0xFB, 0xFD, 0xFF] {
            let m = base << 16;
            assert_eq!(pak_to_bus(m), 0x7E0000, "mirror base ${:02X}", base);
            if m + 0x10000 <= 0xFFFFFF {
                assert_eq!(pak_to_bus(m + 0x10000), 0x7F0000, "mirror base ${:02X}", base);
            }
        }
    }

    #[test]
    fn test_sram_mirror_matches_primary() {
        for offset in (0..SRAM_MIRROR).step_by(0x1FFF) {
            assert_eq!(
                pak_to_bus(SRAM_START + offset),
                pak_to_bus(SRAM_START + SRAM_MIRROR + offset)
            );
        }
    }

    #[test]
    fn test_unmapped_pak_passes_through() {
        assert_eq!(pak_to_bus(0xF00000), 0xF00000);
        assert_eq!(pak_to_bus(0xF4FFFF), 0xF4FFFF);
        assert_eq!(pak_to_bus(0x1000000), 0x1000000);
    }

    #[test]
    fn test_bus_to_pak_round_trip() {
        for pak in (0..ROM_MIRROR).step_by(0x3FF1) {
            assert_eq!(bus_to_pak(pak_to_bus(pak)).unwrap(), pak, "ROM ${:06X}", pak);
        }
        for pak in (SRAM_START..SRAM_START + SRAM_MIRROR).step_by(0x7F1) {
            assert_eq!(bus_to_pak(pak_to_bus(pak)).unwrap(), pak, "SRAM ${:06X}", pak);
        }
        for pak in (WRAM_START..WRAM_START + WRAM_SIZE).step_by(0x101) {
            assert_eq!(bus_to_pak(pak_to_bus(pak)).unwrap(), pak, "WRAM ${:06X}", pak);
        }
    }

    #[test]
    fn test_bus_to_pak_mirrors() {
        // low RAM mirror
        assert_eq!(bus_to_pak(0x001A).unwrap(), 0xF5001A);
        assert_eq!(bus_to_pak(0x80_1FFF).unwrap(), 0xF51FFF);
        // ROM in the low bank half of $40-$6F
        assert_eq!(bus_to_pak(0x40_0000).unwrap(), 0x200000);
        assert_eq!(bus_to_pak(0x40_8000).unwrap(), 0x200000);
        // SRAM in $70-$7D
        assert_eq!(bus_to_pak(0x70_0000).unwrap(), 0xE00000);
        assert_eq!(bus_to_pak(0x7D_7FFF).unwrap(), 0xE6FFFF);
    }

    #[test]
    fn test_bus_to_pak_unmapped_registers() {
        assert!(matches!(
            bus_to_pak(0x00_2100),
            Err(SniError::UnmappedAddress(0x002100))
        ));
        assert!(bus_to_pak(0x80_4200).is_err());
    }

    #[test]
    fn test_bus_to_pak_rejects_wide_addresses() {
        // bank $17E would otherwise alias WRAM at $7E
        assert!(matches!(
            bus_to_pak(0x17E_0010),
            Err(SniError::UnmappedAddress(0x17E_0010))
        ));
        assert!(bus_to_pak(u32::MAX).is_err());
    }
}
