use ahash::HashMap;

pub use self::opcodes::{nmos6502, AddressingMode, Opcodes};
use crate::ast::{self, Operand, Value};

mod opcodes;

/// Selected encoding of a single instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encoding {
    pub opcode: u8,
    pub mode: AddressingMode,
}

impl Encoding {
    #[inline]
    pub fn size(&self) -> u8 {
        self.mode.size()
    }
}

/// Encoded instruction.
#[derive(Debug, Clone)]
pub struct Instruction<'a> {
    pub stmt: &'a ast::Instr<'a>,
    pub address: u32,
    pub opcode: u8,
    pub size: u8,
}

/// Picks the opcode for an instruction based on its operand shape.
pub fn select(instr: &ast::Instr<'_>) -> Result<Encoding, AsmError> {
    use AddressingMode as Mode;

    let opcodes = nmos6502();
    let name = instr.mnemonic.to_ascii_lowercase();

    let lookup = |mode: Mode| {
        opcodes
            .get(mode, &name)
            .map(|opcode| Encoding { opcode, mode })
    };
    let unknown = |mode: Mode| AsmError::UnknownInstruction {
        mnemonic: instr.mnemonic.into(),
        mode,
        line: instr.line,
        span: instr.mnemonic_span,
    };

    match instr.operand {
        Operand::Implied => lookup(Mode::Implied)
            .or_else(|| lookup(Mode::Accumulator))
            .ok_or_else(|| unknown(Mode::Implied)),
        Operand::Immediate(value) => {
            let encoding = lookup(Mode::Immediate).ok_or_else(|| unknown(Mode::Immediate))?;
            check_value(instr, value, 0xff)?;
            Ok(encoding)
        }
        Operand::Direct(address) => {
            check_range(instr, address, 0xffff)?;
            if let Some(encoding) = lookup(Mode::Relative) {
                return Ok(encoding);
            }
            let zero_page = if address <= 0xff {
                lookup(Mode::ZeroPage)
            } else {
                None
            };
            zero_page
                .or_else(|| lookup(Mode::Absolute))
                .ok_or_else(|| unknown(Mode::Absolute))
        }
        Operand::DirectWithLabel(label) => {
            if label.eq_ignore_ascii_case("a") {
                if let Some(encoding) = lookup(Mode::Accumulator) {
                    return Ok(encoding);
                }
            }
            lookup(Mode::Relative)
                .or_else(|| lookup(Mode::Absolute))
                .ok_or_else(|| unknown(Mode::Absolute))
        }
        Operand::DirectIndexed { address, register } => {
            let (zero_page_mode, absolute_mode) = match index_register(instr, register)? {
                Index::X => (Mode::ZeroPageX, Mode::AbsoluteX),
                Index::Y => (Mode::ZeroPageY, Mode::AbsoluteY),
            };
            check_range(instr, address, 0xffff)?;
            let zero_page = if address <= 0xff {
                lookup(zero_page_mode)
            } else {
                None
            };
            zero_page
                .or_else(|| lookup(absolute_mode))
                .ok_or_else(|| unknown(absolute_mode))
        }
        Operand::DirectWithLabelIndexed { register, .. } => {
            let mode = match index_register(instr, register)? {
                Index::X => Mode::AbsoluteX,
                Index::Y => Mode::AbsoluteY,
            };
            lookup(mode).ok_or_else(|| unknown(mode))
        }
        Operand::IndirectX { address, register } => {
            expect_register(instr, register, Index::X)?;
            let encoding = lookup(Mode::IndirectX).ok_or_else(|| unknown(Mode::IndirectX))?;
            check_value(instr, address, 0xff)?;
            Ok(encoding)
        }
        Operand::IndirectY { address, register } => {
            expect_register(instr, register, Index::Y)?;
            let encoding = lookup(Mode::IndirectY).ok_or_else(|| unknown(Mode::IndirectY))?;
            check_value(instr, address, 0xff)?;
            Ok(encoding)
        }
        Operand::Indirect(address) => {
            let encoding = lookup(Mode::Indirect).ok_or_else(|| unknown(Mode::Indirect))?;
            check_value(instr, address, 0xffff)?;
            Ok(encoding)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Index {
    X,
    Y,
}

fn index_register(instr: &ast::Instr<'_>, register: ast::Register<'_>) -> Result<Index, AsmError> {
    if register.name.eq_ignore_ascii_case("x") {
        Ok(Index::X)
    } else if register.name.eq_ignore_ascii_case("y") {
        Ok(Index::Y)
    } else {
        Err(AsmError::InvalidRegister {
            expected: "X or Y",
            line: instr.line,
            span: register.span,
        })
    }
}

fn expect_register(
    instr: &ast::Instr<'_>,
    register: ast::Register<'_>,
    expected: Index,
) -> Result<(), AsmError> {
    let invalid = || AsmError::InvalidRegister {
        expected: match expected {
            Index::X => "X",
            Index::Y => "Y",
        },
        line: instr.line,
        span: register.span,
    };

    match index_register(instr, register) {
        Ok(index) if index == expected => Ok(()),
        _ => Err(invalid()),
    }
}

fn check_value(instr: &ast::Instr<'_>, value: Value<'_>, max: u32) -> Result<(), AsmError> {
    match value {
        Value::Int(value) => check_range(instr, value, max),
        Value::Name(_) => Ok(()),
    }
}

fn check_range(instr: &ast::Instr<'_>, value: u32, max: u32) -> Result<(), AsmError> {
    if value <= max {
        Ok(())
    } else {
        Err(AsmError::OutOfRange {
            value,
            max,
            line: instr.line,
            span: instr.span,
        })
    }
}

/// Flat encoding of a parsed program.
///
/// Collects variables, label addresses and encoded instructions in a single
/// walk. Errors are accumulated in source order and never stop the walk.
pub struct Program<'a> {
    pub ast: &'a ast::Ast<'a>,
    pub variables: HashMap<&'a str, u32>,
    pub labels: HashMap<&'a str, u32>,
    pub instructions: Vec<Instruction<'a>>,
    /// Start address of every statement that occupies bytes.
    pub offsets: HashMap<u32, &'a ast::Stmt<'a>>,
    pub errors: Vec<AsmError>,
    /// Address of each statement, indexed like `Ast::items`.
    addresses: Vec<Option<u32>>,
    pc: u32,
}

impl<'a> Program<'a> {
    pub fn new(ast: &'a ast::Ast<'a>) -> Self {
        Self {
            ast,
            variables: Default::default(),
            labels: Default::default(),
            instructions: Vec::new(),
            offsets: Default::default(),
            errors: Vec::new(),
            addresses: Vec::with_capacity(ast.items.len()),
            pc: 0,
        }
    }

    pub fn collect(ast: &'a ast::Ast<'a>) -> Self {
        let mut program = Self::new(ast);
        ast.walk(&mut program);
        program
    }

    /// Address assigned to an occupying statement.
    pub fn address_of(&self, stmt: &ast::Stmt<'_>) -> Option<u32> {
        let index = self.ast.index_of(stmt)?;
        self.addresses.get(index).copied().flatten()
    }

    fn occupy(&mut self, stmt: &'a ast::Stmt<'a>, size: u32) {
        self.offsets.insert(self.pc, stmt);
        if let Some(address) = self.addresses.last_mut() {
            *address = Some(self.pc);
        }
        self.pc = self.pc.wrapping_add(size);
    }
}

impl<'a> ast::Visitor<'a> for Program<'a> {
    fn visit(&mut self, stmt: &'a ast::Stmt<'a>) {
        self.addresses.push(None);
        match stmt {
            ast::Stmt::Assign(assign) => {
                self.variables.insert(assign.name, assign.value);
            }
            ast::Stmt::Label(label) => {
                if self.labels.contains_key(label.name) {
                    self.errors.push(AsmError::DuplicateLabel {
                        name: label.name.into(),
                        line: label.line,
                        span: label.span,
                    });
                } else {
                    self.labels.insert(label.name, self.pc);
                }
            }
            ast::Stmt::Org(org) => self.pc = org.address,
            ast::Stmt::Data(data) => self.occupy(stmt, data.size()),
            ast::Stmt::Instr(instr) => match select(instr) {
                Ok(encoding) => {
                    self.instructions.push(Instruction {
                        stmt: instr,
                        address: self.pc,
                        opcode: encoding.opcode,
                        size: encoding.size(),
                    });
                    self.occupy(stmt, encoding.size() as u32);
                }
                Err(e) => self.errors.push(e),
            },
        }
    }

    fn visit_end(&mut self, _: &'a ast::Ast<'a>) {}
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum AsmError {
    #[error("line {line}: unrecognized {mode} instruction: {mnemonic}")]
    UnknownInstruction {
        mnemonic: Box<str>,
        mode: AddressingMode,
        line: usize,
        span: ast::Span,
    },
    #[error("line {line}: register argument must be {expected}")]
    InvalidRegister {
        expected: &'static str,
        line: usize,
        span: ast::Span,
    },
    #[error("line {line}: value {value:#x} is out of range (max {max:#x})")]
    OutOfRange {
        value: u32,
        max: u32,
        line: usize,
        span: ast::Span,
    },
    #[error("line {line}: label `{name}` is already defined")]
    DuplicateLabel {
        name: Box<str>,
        line: usize,
        span: ast::Span,
    },
    #[error("line {line}: label reference `{name}` does not fit into a byte")]
    LabelInByteData {
        name: Box<str>,
        line: usize,
        span: ast::Span,
    },
    #[error("line {line}: undefined variable `{name}`")]
    UndefinedVariable {
        name: Box<str>,
        line: usize,
        span: ast::Span,
    },
    #[error("line {line}: {kind} instruction `{mnemonic}` lacks an IR lowering implementation")]
    NotLowered {
        kind: ast::InstrKind,
        mnemonic: Box<str>,
        line: usize,
        span: ast::Span,
    },
}

impl AsmError {
    pub fn span(&self) -> ast::Span {
        match self {
            Self::UnknownInstruction { span, .. }
            | Self::InvalidRegister { span, .. }
            | Self::OutOfRange { span, .. }
            | Self::DuplicateLabel { span, .. }
            | Self::LabelInByteData { span, .. }
            | Self::UndefinedVariable { span, .. }
            | Self::NotLowered { span, .. } => *span,
        }
    }

    pub fn line(&self) -> usize {
        match self {
            Self::UnknownInstruction { line, .. }
            | Self::InvalidRegister { line, .. }
            | Self::OutOfRange { line, .. }
            | Self::DuplicateLabel { line, .. }
            | Self::LabelInByteData { line, .. }
            | Self::UndefinedVariable { line, .. }
            | Self::NotLowered { line, .. } => *line,
        }
    }
}
