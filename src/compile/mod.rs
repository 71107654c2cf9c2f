use ahash::HashMap;

use crate::asm::{AsmError, Program};
use crate::ast::{self, DataValue, DataWidth, Stmt};
use crate::ir::{self, BlockId, FuncId, GlobalId, Linkage, Module, OptLevel, PassManager, Type};

mod lower;

pub const NMI_VECTOR: u32 = 0xfffa;
pub const RESET_VECTOR: u32 = 0xfffc;
pub const IRQ_VECTOR: u32 = 0xfffe;

/// Hardware vector slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vector {
    Nmi,
    Reset,
    Irq,
}

impl Vector {
    pub const ALL: [Self; 3] = [Self::Nmi, Self::Reset, Self::Irq];

    pub const fn address(self) -> u32 {
        match self {
            Self::Nmi => NMI_VECTOR,
            Self::Reset => RESET_VECTOR,
            Self::Irq => IRQ_VECTOR,
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Vector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Nmi => "nmi",
            Self::Reset => "reset",
            Self::Irq => "irq",
        })
    }
}

#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub module_name: String,
    pub opt_level: OptLevel,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            module_name: "asm_module".to_owned(),
            opt_level: OptLevel::None,
        }
    }
}

/// Result of the lowering pipeline.
///
/// Warnings and accumulated errors are reported even when the module could
/// not be produced.
#[derive(Debug)]
pub struct CompileOutput {
    pub warnings: Vec<Warning>,
    pub errors: Vec<AsmError>,
    pub module: Result<Module, CompileError>,
}

impl CompileOutput {
    /// No fatal error and no accumulated errors.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.module.is_ok()
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    #[error("line {line}: trashing data at {address:#06x}")]
    TrashedData {
        address: u32,
        line: usize,
        span: ast::Span,
    },
    #[error("line {line}: unreachable code: `{mnemonic}` follows a terminated block")]
    UnreachableCode {
        mnemonic: Box<str>,
        line: usize,
        span: ast::Span,
    },
}

impl Warning {
    pub fn span(&self) -> ast::Span {
        match self {
            Self::TrashedData { span, .. } | Self::UnreachableCode { span, .. } => *span,
        }
    }

    pub fn line(&self) -> usize {
        match self {
            Self::TrashedData { line, .. } | Self::UnreachableCode { line, .. } => *line,
        }
    }
}

/// Error which aborts the pipeline.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("missing {vector} entry point at {:#06x}", .vector.address())]
    MissingEntryPoint { vector: Vector },
    #[error(
        "line {line}: {vector} entry point at {:#06x} must be a word-sized data declaration",
        .vector.address()
    )]
    EntryPointNotWord {
        vector: Vector,
        line: usize,
        span: ast::Span,
    },
    #[error(
        "line {line}: {vector} entry point at {:#06x} must reference a label",
        .vector.address()
    )]
    EntryPointNotLabel {
        vector: Vector,
        line: usize,
        span: ast::Span,
    },
    #[error("missing {vector} entry point")]
    UnresolvedEntryPoint { vector: Vector },
    #[error("invalid module: {0}")]
    Verify(#[from] ir::VerifyError),
}

impl CompileError {
    pub fn span(&self) -> Option<ast::Span> {
        match self {
            Self::EntryPointNotWord { span, .. } | Self::EntryPointNotLabel { span, .. } => {
                Some(*span)
            }
            Self::MissingEntryPoint { .. }
            | Self::UnresolvedEntryPoint { .. }
            | Self::Verify(_) => None,
        }
    }
}

/// Lowers a collected program into an IR module.
pub fn compile(program: &Program<'_>, options: &CompileOptions) -> CompileOutput {
    let mut c = Compilation::new(program, options);
    let module = c.run();
    CompileOutput {
        warnings: c.warnings,
        errors: c.errors,
        module,
    }
}

/// Stack slots modeling the CPU state.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Registers {
    pub x: ir::Value,
    pub y: ir::Value,
    pub a: ir::Value,
    pub neg: ir::Value,
    pub zero: ir::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reg {
    A,
    X,
    Y,
}

impl Registers {
    pub fn get(&self, reg: Reg) -> ir::Value {
        match reg {
            Reg::A => self.a,
            Reg::X => self.x,
            Reg::Y => self.y,
        }
    }
}

enum DataBuffer<'a> {
    Closed,
    Open { label: &'a str, bytes: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cursor {
    Closed,
    Open(BlockId),
}

/// State of the lowering pipeline.
pub struct Compilation<'a> {
    program: &'a Program<'a>,
    opt_level: OptLevel,
    warnings: Vec<Warning>,
    errors: Vec<AsmError>,
    module: Module,
    main: FuncId,
    entry: BlockId,
    regs: Registers,
    labeled_data: HashMap<&'a str, GlobalId>,
    buffer: DataBuffer<'a>,
    basic_blocks: HashMap<&'a str, BlockId>,
    cursor: Cursor,
    /// Labels referenced by the vectors.
    entry_points: [Option<&'a str>; 3],
}

impl<'a> Compilation<'a> {
    fn new(program: &'a Program<'a>, options: &CompileOptions) -> Self {
        let mut module = Module::new(options.module_name.as_str());

        module.add_function("putchar", Type::I32, vec![Type::I32], Linkage::External);

        let exit = module.add_function("exit", Type::Void, vec![Type::I32], Linkage::External);
        let attrs = &mut module.function_mut(exit).attrs;
        attrs.noreturn = true;
        attrs.nounwind = true;

        let main = module.add_function("main", Type::I32, Vec::new(), Linkage::External);
        let entry = module.function_mut(main).append_block("Entry");
        let mut b = module.builder(main, entry);
        let regs = Registers {
            x: b.alloca(Type::I8, "X"),
            y: b.alloca(Type::I8, "Y"),
            a: b.alloca(Type::I8, "A"),
            neg: b.alloca(Type::I1, "S_neg"),
            zero: b.alloca(Type::I1, "S_zero"),
        };

        Self {
            program,
            opt_level: options.opt_level,
            // Collector errors come first so one run reports everything.
            errors: program.errors.clone(),
            warnings: Vec::new(),
            module,
            main,
            entry,
            regs,
            labeled_data: Default::default(),
            buffer: DataBuffer::Closed,
            basic_blocks: Default::default(),
            cursor: Cursor::Closed,
            entry_points: [None; 3],
        }
    }

    fn run(&mut self) -> Result<Module, CompileError> {
        let ast = self.program.ast;

        tracing::debug!("data pass");
        ast.walk(&mut DataPass(self));

        for vector in Vector::ALL {
            let label = self.resolve_entry_point(vector)?;
            tracing::debug!(%vector, label, "resolved entry point");
            self.entry_points[vector.index()] = Some(label);
        }

        tracing::debug!("code pass");
        ast.walk(&mut CodePass(self));

        let nmi = self.entry_block(Vector::Nmi)?;
        let reset = self.entry_block(Vector::Reset)?;
        let irq = self.entry_block(Vector::Irq)?;
        tracing::debug!(?nmi, ?reset, ?irq, "entry points lowered");

        self.module.builder(self.main, self.entry).br(reset);

        let mut module = std::mem::take(&mut self.module);
        ir::verify(&module)?;

        let mut pm = PassManager::for_level(self.opt_level);
        if pm.is_empty() {
            return Ok(module);
        }
        if pm.run(&mut module) {
            tracing::debug!(level = ?self.opt_level, "module optimized");
            ir::verify(&module)?;
        }

        Ok(module)
    }

    /// Finds the label referenced by the word stored at the vector address.
    fn resolve_entry_point(&self, vector: Vector) -> Result<&'a str, CompileError> {
        let program: &'a Program<'a> = self.program;
        let Some(&stmt) = program.offsets.get(&vector.address()) else {
            return Err(CompileError::MissingEntryPoint { vector });
        };

        let data = match stmt {
            Stmt::Data(data) if data.width == DataWidth::Word => data,
            _ => {
                return Err(CompileError::EntryPointNotWord {
                    vector,
                    line: stmt.line(),
                    span: stmt.span(),
                })
            }
        };

        match data.items.first().map(|item| item.value) {
            Some(DataValue::Label(label)) => Ok(label),
            _ => Err(CompileError::EntryPointNotLabel {
                vector,
                line: data.line,
                span: data.span,
            }),
        }
    }

    fn entry_block(&self, vector: Vector) -> Result<BlockId, CompileError> {
        self.entry_points[vector.index()]
            .and_then(|label| self.basic_blocks.get(label).copied())
            .ok_or(CompileError::UnresolvedEntryPoint { vector })
    }

    pub(crate) fn builder(&mut self, block: BlockId) -> ir::Builder<'_> {
        self.module.builder(self.main, block)
    }

    pub(crate) fn regs(&self) -> Registers {
        self.regs
    }

    pub(crate) fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub(crate) fn variable(&self, name: &str) -> Option<u32> {
        self.program.variables.get(name).copied()
    }

    pub(crate) fn push_error(&mut self, error: AsmError) {
        self.errors.push(error);
    }

    pub(crate) fn push_warning(&mut self, warning: Warning) {
        self.warnings.push(warning);
    }

    // === Data pass ===

    fn start_data(&mut self, label: &'a str) {
        self.buffer = DataBuffer::Open {
            label,
            bytes: Vec::new(),
        };
    }

    fn add_data(&mut self, stmt: &'a Stmt<'a>, data: &'a ast::Data<'a>) {
        let DataBuffer::Open { bytes, .. } = &mut self.buffer else {
            self.warnings.push(Warning::TrashedData {
                address: self.program.address_of(stmt).unwrap_or_default(),
                line: data.line,
                span: data.span,
            });
            return;
        };

        for item in &data.items {
            match item.value {
                DataValue::Int(value) => match u8::try_from(value) {
                    Ok(byte) => bytes.push(byte),
                    Err(_) => {
                        self.errors.push(AsmError::OutOfRange {
                            value,
                            max: 0xff,
                            line: data.line,
                            span: item.span,
                        });
                        return;
                    }
                },
                DataValue::Str(s) => bytes.extend_from_slice(s.as_bytes()),
                DataValue::Label(name) => {
                    self.errors.push(AsmError::LabelInByteData {
                        name: name.into(),
                        line: data.line,
                        span: item.span,
                    });
                    return;
                }
            }
        }
    }

    fn finish_data(&mut self) {
        let DataBuffer::Open { label, bytes } =
            std::mem::replace(&mut self.buffer, DataBuffer::Closed)
        else {
            return;
        };
        if bytes.is_empty() {
            return;
        }

        let global = self.module.add_global(label, Linkage::Private, bytes);
        tracing::debug!(label, name = %self.module.global(global).name, "data global");
        // The first global of a duplicated label wins.
        self.labeled_data.entry(label).or_insert(global);
    }

    // === Code pass ===

    fn lower_label(&mut self, label: &'a ast::Label<'a>) {
        if self.labeled_data.contains_key(label.name) {
            return;
        }

        let block = self.module.function_mut(self.main).append_block(label.name);
        if let Cursor::Open(prev) = self.cursor {
            self.builder(prev).br(block);
        }
        self.cursor = Cursor::Open(block);
        tracing::trace!(label = label.name, line = label.line, "opened block");

        // Duplicates were reported by the collector, the first block wins.
        if self.basic_blocks.contains_key(label.name) {
            return;
        }
        self.basic_blocks.insert(label.name, block);

        let mut terminate = false;
        for vector in Vector::ALL {
            if self.entry_points[vector.index()] != Some(label.name) {
                continue;
            }
            tracing::debug!(%vector, label = label.name, "entry block");
            self.module.function_mut(self.main).block_mut(block).pinned = true;
            terminate |= vector != Vector::Reset;
        }

        // Interrupt handler bodies are not lowered.
        if terminate {
            self.builder(block).unreachable();
            self.cursor = Cursor::Closed;
        }
    }

    fn close_block(&mut self) {
        if let Cursor::Open(block) = std::mem::replace(&mut self.cursor, Cursor::Closed) {
            self.builder(block).unreachable();
        }
    }
}

struct DataPass<'c, 'a>(&'c mut Compilation<'a>);

impl<'a> ast::Visitor<'a> for DataPass<'_, 'a> {
    fn visit(&mut self, stmt: &'a Stmt<'a>) {
        match stmt {
            Stmt::Data(data) if data.width == DataWidth::Byte => self.0.add_data(stmt, data),
            Stmt::Label(label) => {
                self.0.finish_data();
                self.0.start_data(label.name);
            }
            _ => self.0.finish_data(),
        }
    }

    fn visit_end(&mut self, _: &'a ast::Ast<'a>) {
        self.0.finish_data();
    }
}

struct CodePass<'c, 'a>(&'c mut Compilation<'a>);

impl<'a> ast::Visitor<'a> for CodePass<'_, 'a> {
    fn visit(&mut self, stmt: &'a Stmt<'a>) {
        match stmt {
            Stmt::Label(label) => self.0.lower_label(label),
            // Instructions which failed to encode were already reported.
            Stmt::Instr(instr) if self.0.program.address_of(stmt).is_some() => {
                lower::lower_instr(self.0, instr)
            }
            Stmt::Instr(_) | Stmt::Assign(_) | Stmt::Org(_) | Stmt::Data(_) => {}
        }
    }

    fn visit_end(&mut self, _: &'a ast::Ast<'a>) {
        self.0.close_block();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Inst;

    const VECTORS: &str = "
nmi:
irq:
        org $fffa
        dc.w nmi
        dc.w reset
        dc.w irq
";

    fn compile_text(text: &str, opt_level: OptLevel) -> CompileOutput {
        let (ast, parser_errors) = ast::parse(text);
        assert!(parser_errors.is_empty(), "{parser_errors:?}");
        let program = Program::collect(&ast);
        compile(
            &program,
            &CompileOptions {
                opt_level,
                ..Default::default()
            },
        )
    }

    fn block_names(module: &Module) -> Vec<&str> {
        let main = module.get_function("main").unwrap();
        module
            .function(main)
            .blocks
            .iter()
            .map(|block| block.name.as_str())
            .collect()
    }

    #[test]
    fn data_extraction() -> anyhow::Result<()> {
        let text = format!(
            "\
        org $0200
        dc.b 1, 2
msg:    dc.b \"hi\", 10
        dc.b 0
empty:
        org $0300
bad:    dc.b 1, $100, 2
        dc.b 3
word:   dc.w 7
        dc.b 9
reset:
{VECTORS}"
        );
        let output = compile_text(&text, OptLevel::None);
        let module = output.module?;

        let globals = module
            .globals
            .iter()
            .map(|g| (g.name.as_str(), g.linkage, g.init.as_slice()))
            .collect::<Vec<_>>();
        assert_eq!(
            globals,
            [
                ("msg", Linkage::Private, b"hi\n\0".as_slice()),
                ("bad", Linkage::Private, [1u8, 3].as_slice()),
            ]
        );

        let trashed = output
            .warnings
            .iter()
            .map(|w| match w {
                Warning::TrashedData { address, line, .. } => (*address, *line),
                w => panic!("unexpected warning: {w}"),
            })
            .collect::<Vec<_>>();
        assert_eq!(trashed, [(0x0200, 2), (0x0306, 10)]);

        assert_eq!(output.errors.len(), 1);
        assert!(matches!(
            output.errors[0],
            AsmError::OutOfRange {
                value: 0x100,
                line: 7,
                ..
            }
        ));

        // Data labels never become blocks, empty ones do.
        assert_eq!(
            block_names(&module),
            ["Entry", "empty", "word", "reset", "nmi", "irq"]
        );
        Ok(())
    }

    #[test]
    fn label_data_in_bytes() {
        let text = format!("table:  dc.b 1, reset, 2\nreset:\n{VECTORS}");
        let output = compile_text(&text, OptLevel::None);
        assert!(matches!(
            output.errors.as_slice(),
            [AsmError::LabelInByteData { name, line: 1, .. }] if &**name == "reset"
        ));
        let module = output.module.unwrap();
        assert_eq!(module.globals[0].init, [1]);
    }

    #[test]
    fn code_pass_threads_blocks() -> anyhow::Result<()> {
        let text = "\
        org $c000
reset:  lda #$10
loop:   inx
        dex
nmi:    nop
irq:
after:  ldy #0
        org $fffa
        dc.w nmi
        dc.w reset
        dc.w irq
";
        let output = compile_text(text, OptLevel::None);
        assert!(output.errors.is_empty(), "{:?}", output.errors);
        assert!(matches!(
            output.warnings.as_slice(),
            [Warning::UnreachableCode { line: 5, .. }]
        ));

        let module = output.module?;
        assert_eq!(
            block_names(&module),
            ["Entry", "reset", "loop", "nmi", "irq", "after"]
        );

        let main = module.function(module.get_function("main").unwrap());
        let id = |name| main.find_block(name).unwrap();
        for block in &main.blocks {
            assert!(block.is_terminated(), "{} is open", block.name);
        }
        assert_eq!(main.block(id("Entry")).insts.last(), Some(&Inst::Br(id("reset"))));
        assert_eq!(main.block(id("reset")).insts.last(), Some(&Inst::Br(id("loop"))));
        assert_eq!(main.block(id("loop")).insts.last(), Some(&Inst::Br(id("nmi"))));
        assert_eq!(main.block(id("nmi")).insts, [Inst::Unreachable]);
        assert_eq!(main.block(id("irq")).insts, [Inst::Unreachable]);
        assert_eq!(main.block(id("after")).insts.last(), Some(&Inst::Unreachable));

        let pinned = main
            .blocks
            .iter()
            .filter(|b| b.pinned)
            .map(|b| b.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(pinned, ["reset", "nmi", "irq"]);

        // Nothing branches into `after`.
        let output = compile_text(text, OptLevel::Basic);
        let module = output.module?;
        assert_eq!(
            block_names(&module),
            ["Entry", "reset", "loop", "nmi", "irq"]
        );
        Ok(())
    }

    #[test]
    fn module_text() -> anyhow::Result<()> {
        let text = format!("VALUE = $80\nreset:  lda #VALUE\n{VECTORS}");
        let module = compile_text(&text, OptLevel::None).module?;
        let text = module.to_string();

        assert!(text.starts_with("; ModuleID = 'asm_module'\n"));
        assert!(text.contains("declare i32 @putchar(i32)\n"));
        assert!(text.contains("declare void @exit(i32) noreturn nounwind\n"));
        assert!(text.contains("define i32 @main() {\nEntry:\n  %X = alloca i8\n"));
        assert!(text.contains("  %S_zero = alloca i1\n  br label %reset\n"));
        assert!(text.contains("  store i8 -128, ptr %A\n"));
        Ok(())
    }

    #[test]
    fn unsupported_instructions() {
        let text = format!("reset:  sta $10\n        xyz\n        ldx #MISSING\n{VECTORS}");
        let output = compile_text(&text, OptLevel::None);

        let errors = output.errors.iter().map(|e| e.line()).collect::<Vec<_>>();
        // Collector errors come first.
        assert_eq!(errors, [2, 1, 3]);
        assert!(matches!(
            &output.errors[0],
            AsmError::UnknownInstruction { mnemonic, .. } if &**mnemonic == "xyz"
        ));
        assert!(matches!(
            &output.errors[1],
            AsmError::NotLowered {
                kind: ast::InstrKind::Direct,
                ..
            }
        ));
        assert!(matches!(
            &output.errors[2],
            AsmError::UndefinedVariable { name, .. } if &**name == "MISSING"
        ));
        assert_eq!(
            output.errors[1].to_string(),
            "line 1: direct instruction `sta` lacks an IR lowering implementation"
        );

        // Accumulated errors don't stop the module from being built.
        assert!(output.module.is_ok());
        assert!(!output.is_clean());
    }

    #[test]
    fn data_labels_never_clash() -> anyhow::Result<()> {
        let text = format!(
            "\
reset:  nop
exit:   dc.b 0
main:   dc.b \"hi\"
text:   dc.b 1
text:   dc.b 2
{VECTORS}"
        );
        let output = compile_text(&text, OptLevel::None);

        let lines = output.errors.iter().map(AsmError::line).collect::<Vec<_>>();
        assert_eq!(lines, [5]);
        assert!(matches!(output.errors[0], AsmError::DuplicateLabel { .. }));

        let module = output.module?;
        let globals = module
            .globals
            .iter()
            .map(|global| (global.name.as_str(), global.init.as_slice()))
            .collect::<Vec<_>>();
        assert_eq!(
            globals,
            [
                ("exit.1", &[0u8][..]),
                ("main.1", &b"hi"[..]),
                ("text", &[1u8][..]),
                ("text.1", &[2u8][..]),
            ]
        );

        let exit = module.function(module.get_function("exit").unwrap());
        assert!(exit.is_declaration() && exit.attrs.noreturn);
        assert_eq!(block_names(&module), ["Entry", "reset", "nmi", "irq"]);
        Ok(())
    }

    #[test]
    fn entry_point_errors() {
        let fatal = |text: &str| compile_text(text, OptLevel::None).module.unwrap_err();

        assert_eq!(
            fatal("reset:\n"),
            CompileError::MissingEntryPoint {
                vector: Vector::Nmi
            }
        );

        let err = fatal("        org $fffa\n        dc.b 1, 2\n");
        assert!(matches!(
            err,
            CompileError::EntryPointNotWord {
                vector: Vector::Nmi,
                line: 2,
                ..
            }
        ));
        assert_eq!(
            err.to_string(),
            "line 2: nmi entry point at 0xfffa must be a word-sized data declaration"
        );

        let err = fatal("        org $fffa\n        dc.w nmi\n        dc.w $c000\n");
        assert!(matches!(
            err,
            CompileError::EntryPointNotLabel {
                vector: Vector::Reset,
                line: 3,
                ..
            }
        ));

        // Labels claimed as data never get a block.
        let vectors = VECTORS.replace("dc.w nmi", "dc.w nmi_data");
        let err = fatal(&format!("reset:\nnmi_data: dc.b 1\n{vectors}"));
        assert_eq!(
            err,
            CompileError::UnresolvedEntryPoint {
                vector: Vector::Nmi
            }
        );
        assert_eq!(err.to_string(), "missing nmi entry point");
    }
}
