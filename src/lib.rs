pub use self::asm::{AsmError, Instruction, Program};
pub use self::ast::{ParserError, Span};
pub use self::codegen::{CodegenError, NativeModule};
pub use self::compile::{
    CompileError, CompileOptions, CompileOutput, Vector, Warning, IRQ_VECTOR, NMI_VECTOR,
    RESET_VECTOR,
};
pub use self::ir::{Module, OptLevel, VerifyError};

pub mod asm;
pub mod ast;
pub mod codegen;
pub mod compile;
pub mod ir;

pub struct Code<'a> {
    text: &'a str,
    ast: ast::Ast<'a>,
    parser_errors: Vec<ast::ParserError>,
}

impl<'a> Code<'a> {
    /// Parses and lowers the text with default options.
    ///
    /// Fails on the first error of any kind.
    pub fn compile(text: &'a str) -> anyhow::Result<Module> {
        let code = Self::parse(text).try_into_valid()?;
        let output = code.compile(&CompileOptions::default());
        if let Some(error) = output.errors.into_iter().next() {
            return Err(error.into());
        }
        Ok(output.module?)
    }

    pub fn parse(text: &'a str) -> Self {
        let (ast, parser_errors) = ast::parse(text);

        Self {
            text,
            ast,
            parser_errors,
        }
    }

    pub fn check(&self) -> Vec<AsmError> {
        Program::collect(&self.ast).errors
    }

    pub fn try_into_valid(self) -> Result<ValidCode<'a>, ast::ParserError> {
        match self.parser_errors.into_iter().next() {
            None => Ok(ValidCode {
                text: self.text,
                ast: self.ast,
            }),
            Some(error) => Err(error),
        }
    }

    pub fn parser_errors(&self) -> &[ast::ParserError] {
        &self.parser_errors
    }

    pub fn text(&self) -> &'a str {
        self.text
    }
}

pub struct ValidCode<'a> {
    text: &'a str,
    ast: ast::Ast<'a>,
}

impl<'a> ValidCode<'a> {
    pub fn text(&self) -> &'a str {
        self.text
    }

    /// Flat encoding of the program.
    pub fn program(&self) -> Program<'_> {
        Program::collect(&self.ast)
    }

    pub fn compile(&self, options: &CompileOptions) -> CompileOutput {
        compile::compile(&self.program(), options)
    }

    pub fn check(&self) -> Vec<AsmError> {
        self.program().errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_names(module: &Module) -> Vec<String> {
        let main = module.get_function("main").unwrap();
        module
            .function(main)
            .blocks
            .iter()
            .map(|block| block.name.clone())
            .collect()
    }

    #[test]
    fn vectors_become_entry_blocks() -> anyhow::Result<()> {
        let module = Code::compile(include_str!("tests/entry_points.s"))?;
        assert_eq!(block_names(&module), ["Entry", "nmi", "irq", "L"]);

        let main = module.function(module.get_function("main").unwrap());
        let reset = main.find_block("L").unwrap();
        assert_eq!(
            main.blocks[0].insts.last(),
            Some(&ir::Inst::Br(reset)),
            "outer entry must branch into the reset block"
        );
        assert!(main.blocks[1..].iter().all(|block| block.pinned));

        println!("{module}");
        Ok(())
    }

    #[test]
    fn byte_data_at_reset_vector() -> anyhow::Result<()> {
        let code = Code::parse(include_str!("tests/bad_reset.s")).try_into_valid()?;
        let output = code.compile(&CompileOptions::default());

        assert!(output.errors.is_empty());
        let err = output.module.unwrap_err();
        assert_eq!(
            err,
            CompileError::EntryPointNotWord {
                vector: Vector::Reset,
                line: 7,
                span: err.span().unwrap(),
            }
        );
        assert!(err
            .to_string()
            .ends_with("entry point at 0xfffc must be a word-sized data declaration"));

        assert!(Code::compile(include_str!("tests/bad_reset.s")).is_err());
        Ok(())
    }

    #[test]
    fn immediate_and_indexed_loads() -> anyhow::Result<()> {
        let code = Code::parse(include_str!("tests/encoding.s")).try_into_valid()?;

        let program = code.program();
        assert!(program.errors.is_empty());
        let encoded = program
            .instructions
            .iter()
            .map(|i| (i.address, i.opcode, i.size))
            .collect::<Vec<_>>();
        assert_eq!(
            encoded,
            [
                (0xc000, 0xa9, 2),
                (0xc002, 0xbd, 3),
                (0xc005, 0xe8, 1),
                (0xc006, 0x4c, 3),
            ]
        );
        assert_eq!(program.labels["table"], 0xc009);
        assert_eq!(program.variables.len(), 0);

        let output = code.compile(&CompileOptions {
            module_name: "encoding".to_owned(),
            opt_level: OptLevel::Basic,
        });
        let lines = output.errors.iter().map(AsmError::line).collect::<Vec<_>>();
        assert_eq!(lines, [4, 6]);

        let module = output.module?;
        assert_eq!(module.name, "encoding");
        assert_eq!(module.globals.len(), 1);
        assert_eq!(module.globals[0].name, "table");
        assert_eq!(block_names(&module), ["Entry", "reset", "loop", "nmi", "irq"]);
        Ok(())
    }

    #[test]
    fn parser_errors_block_compilation() {
        let code = Code::parse("reset: lda #\n        inx\n");
        assert!(!code.parser_errors().is_empty());
        assert!(code.parser_errors().iter().all(|e| e.line == 1));
        assert!(code.try_into_valid().is_err());
    }

    #[test]
    fn check_reports_all_errors() {
        let code = Code::parse("  lda ($10), x\n  stx $1000, x\n  xyz\n  sta $10000\n");
        let lines = code.check().iter().map(AsmError::line).collect::<Vec<_>>();
        assert_eq!(lines, [1, 2, 3, 4]);
    }
}
