use std::sync::OnceLock;

use ahash::HashMap;

use super::{Compilation, Cursor, Reg, Registers, Warning};
use crate::asm::AsmError;
use crate::ast::{self, InstrKind, Operand};
use crate::ir::{BinOp, BlockId, Builder, IntPredicate, Type, Value};

type LowerFn = fn(&mut Compilation<'_>, &ast::Instr<'_>, BlockId) -> Result<(), AsmError>;

/// Lowers an instruction into the currently open block.
pub(super) fn lower_instr(c: &mut Compilation<'_>, instr: &ast::Instr<'_>) {
    let kind = instr.operand.kind();
    let name = instr.mnemonic.to_ascii_lowercase();

    let Some(rule) = rules()
        .get(&kind)
        .and_then(|table| table.get(name.as_str()))
    else {
        c.push_error(AsmError::NotLowered {
            kind,
            mnemonic: instr.mnemonic.into(),
            line: instr.line,
            span: instr.span,
        });
        return;
    };

    let Cursor::Open(block) = c.cursor() else {
        c.push_warning(Warning::UnreachableCode {
            mnemonic: instr.mnemonic.into(),
            line: instr.line,
            span: instr.span,
        });
        return;
    };

    tracing::trace!(line = instr.line, mnemonic = instr.mnemonic, "lower");
    if let Err(e) = rule(c, instr, block) {
        c.push_error(e);
    }
}

fn rules() -> &'static HashMap<InstrKind, HashMap<&'static str, LowerFn>> {
    static RULES: OnceLock<HashMap<InstrKind, HashMap<&'static str, LowerFn>>> = OnceLock::new();
    RULES.get_or_init(|| {
        let mut t = HashMap::<InstrKind, HashMap<&'static str, LowerFn>>::default();

        macro_rules! define_rules {
            ($t:ident, $kind:ident, { $($name:literal => $f:path),+$(,)? }) => {{
                let table = $t.entry(InstrKind::$kind).or_default();
                $(table.insert($name, $f as LowerFn);)+
            }};
        }

        define_rules!(t, Immediate, {
            "lda" => lda, "ldx" => ldx, "ldy" => ldy,
        });

        define_rules!(t, Implied, {
            "tax" => tax, "tay" => tay, "txa" => txa, "tya" => tya,
            "inx" => inx, "iny" => iny, "dex" => dex, "dey" => dey,
            "nop" => nop,
        });

        t
    })
}

fn lda(c: &mut Compilation<'_>, instr: &ast::Instr<'_>, block: BlockId) -> Result<(), AsmError> {
    load_immediate(c, instr, block, Reg::A)
}

fn ldx(c: &mut Compilation<'_>, instr: &ast::Instr<'_>, block: BlockId) -> Result<(), AsmError> {
    load_immediate(c, instr, block, Reg::X)
}

fn ldy(c: &mut Compilation<'_>, instr: &ast::Instr<'_>, block: BlockId) -> Result<(), AsmError> {
    load_immediate(c, instr, block, Reg::Y)
}

fn tax(c: &mut Compilation<'_>, _: &ast::Instr<'_>, block: BlockId) -> Result<(), AsmError> {
    transfer(c, block, Reg::A, Reg::X);
    Ok(())
}

fn tay(c: &mut Compilation<'_>, _: &ast::Instr<'_>, block: BlockId) -> Result<(), AsmError> {
    transfer(c, block, Reg::A, Reg::Y);
    Ok(())
}

fn txa(c: &mut Compilation<'_>, _: &ast::Instr<'_>, block: BlockId) -> Result<(), AsmError> {
    transfer(c, block, Reg::X, Reg::A);
    Ok(())
}

fn tya(c: &mut Compilation<'_>, _: &ast::Instr<'_>, block: BlockId) -> Result<(), AsmError> {
    transfer(c, block, Reg::Y, Reg::A);
    Ok(())
}

fn inx(c: &mut Compilation<'_>, _: &ast::Instr<'_>, block: BlockId) -> Result<(), AsmError> {
    step(c, block, Reg::X, BinOp::Add);
    Ok(())
}

fn iny(c: &mut Compilation<'_>, _: &ast::Instr<'_>, block: BlockId) -> Result<(), AsmError> {
    step(c, block, Reg::Y, BinOp::Add);
    Ok(())
}

fn dex(c: &mut Compilation<'_>, _: &ast::Instr<'_>, block: BlockId) -> Result<(), AsmError> {
    step(c, block, Reg::X, BinOp::Sub);
    Ok(())
}

fn dey(c: &mut Compilation<'_>, _: &ast::Instr<'_>, block: BlockId) -> Result<(), AsmError> {
    step(c, block, Reg::Y, BinOp::Sub);
    Ok(())
}

fn nop(_: &mut Compilation<'_>, _: &ast::Instr<'_>, _: BlockId) -> Result<(), AsmError> {
    Ok(())
}

fn load_immediate(
    c: &mut Compilation<'_>,
    instr: &ast::Instr<'_>,
    block: BlockId,
    reg: Reg,
) -> Result<(), AsmError> {
    let Operand::Immediate(value) = instr.operand else {
        return Err(not_lowered(instr));
    };

    let value = match value {
        ast::Value::Int(value) => value,
        ast::Value::Name(name) => c.variable(name).ok_or_else(|| AsmError::UndefinedVariable {
            name: name.into(),
            line: instr.line,
            span: instr.span,
        })?,
    };
    let Ok(value) = u8::try_from(value) else {
        return Err(AsmError::OutOfRange {
            value,
            max: 0xff,
            line: instr.line,
            span: instr.span,
        });
    };

    let regs = c.regs();
    let mut b = c.builder(block);
    let value = Value::int(Type::I8, value as u64);
    b.store(value, regs.get(reg));
    set_flags(&mut b, &regs, value);
    Ok(())
}

fn transfer(c: &mut Compilation<'_>, block: BlockId, from: Reg, to: Reg) {
    let regs = c.regs();
    let mut b = c.builder(block);
    let value = b.load(Type::I8, regs.get(from));
    b.store(value, regs.get(to));
    set_flags(&mut b, &regs, value);
}

/// Wrapping increment or decrement.
fn step(c: &mut Compilation<'_>, block: BlockId, reg: Reg, op: BinOp) {
    let regs = c.regs();
    let mut b = c.builder(block);
    let value = b.load(Type::I8, regs.get(reg));
    let value = b.binary(op, value, Value::int(Type::I8, 1));
    b.store(value, regs.get(reg));
    set_flags(&mut b, &regs, value);
}

fn set_flags(b: &mut Builder<'_>, regs: &Registers, value: Value) {
    let zero = Value::int(Type::I8, 0);
    let neg = b.icmp(IntPredicate::Slt, value, zero);
    b.store(neg, regs.neg);
    let is_zero = b.icmp(IntPredicate::Eq, value, zero);
    b.store(is_zero, regs.zero);
}

fn not_lowered(instr: &ast::Instr<'_>) -> AsmError {
    AsmError::NotLowered {
        kind: instr.operand.kind(),
        mnemonic: instr.mnemonic.into(),
        line: instr.line,
        span: instr.span,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::Program;
    use crate::compile::{compile, CompileOptions};
    use crate::ir::{Inst, Module};

    fn reset_block(text: &str) -> anyhow::Result<(Module, Vec<Inst>)> {
        let text = format!(
            "reset:\n{text}\nnmi:\nirq:\n org $fffa\n dc.w nmi\n dc.w reset\n dc.w irq\n"
        );
        let (ast, parser_errors) = ast::parse(&text);
        assert!(parser_errors.is_empty(), "{parser_errors:?}");
        let program = Program::collect(&ast);
        let output = compile(&program, &CompileOptions::default());
        assert!(output.errors.is_empty(), "{:?}", output.errors);

        let module = output.module?;
        let main = module.function(module.get_function("main").unwrap());
        let block = main.find_block("reset").unwrap();
        let insts = main.block(block).insts.clone();
        Ok((module, insts))
    }

    #[test]
    fn load_immediate_sets_flags() -> anyhow::Result<()> {
        let (module, insts) = reset_block(" lda #0")?;
        // store, icmp, store, icmp, store, br
        assert_eq!(insts.len(), 6);
        assert!(matches!(
            insts[0],
            Inst::Store {
                value: Value::Const {
                    ty: Type::I8,
                    bits: 0
                },
                ..
            }
        ));
        assert!(matches!(
            insts[1],
            Inst::ICmp {
                pred: IntPredicate::Slt,
                ..
            }
        ));
        assert!(matches!(
            insts[3],
            Inst::ICmp {
                pred: IntPredicate::Eq,
                ..
            }
        ));

        let text = module.to_string();
        assert!(text.contains("  store i8 0, ptr %A\n"));
        assert!(text.contains("  store i1 %t5, ptr %S_neg\n"));
        assert!(text.contains("  store i1 %t6, ptr %S_zero\n"));
        Ok(())
    }

    #[test]
    fn register_steps() -> anyhow::Result<()> {
        let (module, insts) = reset_block(" ldx #$ff\n inx\n tax\n nop")?;
        assert!(insts.iter().any(|inst| matches!(
            inst,
            Inst::Binary {
                op: BinOp::Add,
                ..
            }
        )));

        let text = module.to_string();
        assert!(text.contains("  store i8 -1, ptr %X\n"));
        assert!(text.contains("  %t7 = load i8, ptr %X\n  %t8 = add i8 %t7, 1\n  store i8 %t8, ptr %X\n"));
        assert!(text.contains("  %t11 = load i8, ptr %A\n  store i8 %t11, ptr %X\n"));
        Ok(())
    }

    #[test]
    fn immediate_range() {
        let text = "V = $100\nreset: lda #V\nnmi:\nirq:\n org $fffa\n dc.w nmi\n dc.w reset\n dc.w irq\n";
        let (ast, _) = ast::parse(text);
        let program = Program::collect(&ast);
        let output = compile(&program, &CompileOptions::default());
        assert!(matches!(
            output.errors.as_slice(),
            [AsmError::OutOfRange {
                value: 0x100,
                line: 2,
                ..
            }]
        ));
    }
}
