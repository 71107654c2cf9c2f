use std::sync::OnceLock;

use ahash::HashMap;

/// Operand encoding of a 6502 instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressingMode {
    Implied,
    Accumulator,
    Immediate,
    ZeroPage,
    ZeroPageX,
    ZeroPageY,
    Absolute,
    AbsoluteX,
    AbsoluteY,
    IndirectX,
    IndirectY,
    Indirect,
    Relative,
}

impl AddressingMode {
    /// Instruction length in bytes, opcode included.
    pub const fn size(self) -> u8 {
        match self {
            Self::Implied | Self::Accumulator => 1,
            Self::Immediate
            | Self::ZeroPage
            | Self::ZeroPageX
            | Self::ZeroPageY
            | Self::IndirectX
            | Self::IndirectY
            | Self::Relative => 2,
            Self::Absolute | Self::AbsoluteX | Self::AbsoluteY | Self::Indirect => 3,
        }
    }
}

impl std::fmt::Display for AddressingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Implied => "implied",
            Self::Accumulator => "accumulator",
            Self::Immediate => "immediate",
            Self::ZeroPage => "zero page",
            Self::ZeroPageX => "zero page, X",
            Self::ZeroPageY => "zero page, Y",
            Self::Absolute => "absolute",
            Self::AbsoluteX => "absolute, X",
            Self::AbsoluteY => "absolute, Y",
            Self::IndirectX => "indirect, X",
            Self::IndirectY => "indirect, Y",
            Self::Indirect => "indirect",
            Self::Relative => "relative",
        })
    }
}

/// Per-mode tables of lower-case mnemonic to opcode.
pub struct Opcodes {
    tables: HashMap<AddressingMode, HashMap<&'static str, u8>>,
}

impl Opcodes {
    /// Looks up an already lower-cased mnemonic.
    pub fn get(&self, mode: AddressingMode, mnemonic: &str) -> Option<u8> {
        self.tables.get(&mode)?.get(mnemonic).copied()
    }

    pub fn iter(&self, mode: AddressingMode) -> impl Iterator<Item = (&'static str, u8)> + '_ {
        self.tables
            .get(&mode)
            .into_iter()
            .flat_map(|table| table.iter().map(|(name, opcode)| (*name, *opcode)))
    }
}

pub fn nmos6502() -> &'static Opcodes {
    static OPCODES: OnceLock<Opcodes> = OnceLock::new();
    OPCODES.get_or_init(|| {
        let mut t = Opcodes {
            tables: Default::default(),
        };
        register_opcodes(&mut t);
        t
    })
}

fn register_opcodes(t: &mut Opcodes) {
    macro_rules! define_opcodes {
        ($t:ident, $mode:ident, { $($name:literal => $opcode:literal),+$(,)? }) => {{
            let table = $t.tables.entry(AddressingMode::$mode).or_default();
            $(table.insert($name, $opcode);)+
        }};
    }

    define_opcodes!(t, Implied, {
        "brk" => 0x00, "clc" => 0x18, "cld" => 0xd8, "cli" => 0x58,
        "clv" => 0xb8, "dex" => 0xca, "dey" => 0x88, "inx" => 0xe8,
        "iny" => 0xc8, "nop" => 0xea, "pha" => 0x48, "php" => 0x08,
        "pla" => 0x68, "plp" => 0x28, "rti" => 0x40, "rts" => 0x60,
        "sec" => 0x38, "sed" => 0xf8, "sei" => 0x78, "tax" => 0xaa,
        "tay" => 0xa8, "tsx" => 0xba, "txa" => 0x8a, "txs" => 0x9a,
        "tya" => 0x98,
    });

    define_opcodes!(t, Accumulator, {
        "asl" => 0x0a, "lsr" => 0x4a, "rol" => 0x2a, "ror" => 0x6a,
    });

    define_opcodes!(t, Immediate, {
        "adc" => 0x69, "and" => 0x29, "cmp" => 0xc9, "cpx" => 0xe0,
        "cpy" => 0xc0, "eor" => 0x49, "lda" => 0xa9, "ldx" => 0xa2,
        "ldy" => 0xa0, "ora" => 0x09, "sbc" => 0xe9,
    });

    define_opcodes!(t, ZeroPage, {
        "adc" => 0x65, "and" => 0x25, "asl" => 0x06, "bit" => 0x24,
        "cmp" => 0xc5, "cpx" => 0xe4, "cpy" => 0xc4, "dec" => 0xc6,
        "eor" => 0x45, "inc" => 0xe6, "lda" => 0xa5, "ldx" => 0xa6,
        "ldy" => 0xa4, "lsr" => 0x46, "ora" => 0x05, "rol" => 0x26,
        "ror" => 0x66, "sbc" => 0xe5, "sta" => 0x85, "stx" => 0x86,
        "sty" => 0x84,
    });

    define_opcodes!(t, ZeroPageX, {
        "adc" => 0x75, "and" => 0x35, "asl" => 0x16, "cmp" => 0xd5,
        "dec" => 0xd6, "eor" => 0x55, "inc" => 0xf6, "lda" => 0xb5,
        "ldy" => 0xb4, "lsr" => 0x56, "ora" => 0x15, "rol" => 0x36,
        "ror" => 0x76, "sbc" => 0xf5, "sta" => 0x95, "sty" => 0x94,
    });

    define_opcodes!(t, ZeroPageY, {
        "ldx" => 0xb6, "stx" => 0x96,
    });

    define_opcodes!(t, Absolute, {
        "adc" => 0x6d, "and" => 0x2d, "asl" => 0x0e, "bit" => 0x2c,
        "cmp" => 0xcd, "cpx" => 0xec, "cpy" => 0xcc, "dec" => 0xce,
        "eor" => 0x4d, "inc" => 0xee, "jmp" => 0x4c, "jsr" => 0x20,
        "lda" => 0xad, "ldx" => 0xae, "ldy" => 0xac, "lsr" => 0x4e,
        "ora" => 0x0d, "rol" => 0x2e, "ror" => 0x6e, "sbc" => 0xed,
        "sta" => 0x8d, "stx" => 0x8e, "sty" => 0x8c,
    });

    define_opcodes!(t, AbsoluteX, {
        "adc" => 0x7d, "and" => 0x3d, "asl" => 0x1e, "cmp" => 0xdd,
        "dec" => 0xde, "eor" => 0x5d, "inc" => 0xfe, "lda" => 0xbd,
        "ldy" => 0xbc, "lsr" => 0x5e, "ora" => 0x1d, "rol" => 0x3e,
        "ror" => 0x7e, "sbc" => 0xfd, "sta" => 0x9d,
    });

    define_opcodes!(t, AbsoluteY, {
        "adc" => 0x79, "and" => 0x39, "cmp" => 0xd9, "eor" => 0x59,
        "lda" => 0xb9, "ldx" => 0xbe, "ora" => 0x19, "sbc" => 0xf9,
        "sta" => 0x99,
    });

    define_opcodes!(t, IndirectX, {
        "adc" => 0x61, "and" => 0x21, "cmp" => 0xc1, "eor" => 0x41,
        "lda" => 0xa1, "ora" => 0x01, "sbc" => 0xe1, "sta" => 0x81,
    });

    define_opcodes!(t, IndirectY, {
        "adc" => 0x71, "and" => 0x31, "cmp" => 0xd1, "eor" => 0x51,
        "lda" => 0xb1, "ora" => 0x11, "sbc" => 0xf1, "sta" => 0x91,
    });

    define_opcodes!(t, Indirect, {
        "jmp" => 0x6c,
    });

    define_opcodes!(t, Relative, {
        "bcc" => 0x90, "bcs" => 0xb0, "beq" => 0xf0, "bmi" => 0x30,
        "bne" => 0xd0, "bpl" => 0x10, "bvc" => 0x50, "bvs" => 0x70,
    });
}

#[cfg(test)]
mod tests {
    use ahash::HashSet;

    use super::*;

    const ALL_MODES: [AddressingMode; 13] = [
        AddressingMode::Implied,
        AddressingMode::Accumulator,
        AddressingMode::Immediate,
        AddressingMode::ZeroPage,
        AddressingMode::ZeroPageX,
        AddressingMode::ZeroPageY,
        AddressingMode::Absolute,
        AddressingMode::AbsoluteX,
        AddressingMode::AbsoluteY,
        AddressingMode::IndirectX,
        AddressingMode::IndirectY,
        AddressingMode::Indirect,
        AddressingMode::Relative,
    ];

    #[test]
    fn opcodes_are_unique() {
        let opcodes = nmos6502();
        let mut seen = HashSet::default();
        let mut total = 0;
        for mode in ALL_MODES {
            for (name, opcode) in opcodes.iter(mode) {
                assert!(seen.insert(opcode), "duplicate opcode {opcode:#04x} ({name})");
                total += 1;
            }
        }
        // Documented NMOS 6502 instruction set.
        assert_eq!(total, 151);
    }

    #[test]
    fn table_keys_are_lowercase() {
        let opcodes = nmos6502();
        for mode in ALL_MODES {
            for (name, _) in opcodes.iter(mode) {
                assert_eq!(name, name.to_ascii_lowercase());
            }
        }
    }

    #[test]
    fn known_encodings() {
        let opcodes = nmos6502();
        assert_eq!(opcodes.get(AddressingMode::Immediate, "lda"), Some(0xa9));
        assert_eq!(opcodes.get(AddressingMode::AbsoluteX, "lda"), Some(0xbd));
        assert_eq!(opcodes.get(AddressingMode::AbsoluteY, "ldx"), Some(0xbe));
        assert_eq!(opcodes.get(AddressingMode::Implied, "rts"), Some(0x60));
        assert_eq!(opcodes.get(AddressingMode::Implied, "LDA"), None);
        assert_eq!(opcodes.get(AddressingMode::AbsoluteY, "ldy"), None);
    }
}
