use ahash::HashSet;

use super::{Function, Inst, Module, Type, Value};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("symbol `@{0}` is defined more than once")]
    DuplicateSymbol(String),
    #[error("function `@{func}` has more than one block named `{block}`")]
    DuplicateBlock { func: String, block: String },
    #[error("block `{block}` in `@{func}` does not end with a terminator")]
    MissingTerminator { func: String, block: String },
    #[error("block `{block}` in `@{func}` has instructions after its terminator")]
    InstAfterTerminator { func: String, block: String },
    #[error("branch in block `{block}` of `@{func}` targets an unknown block")]
    UnknownBlock { func: String, block: String },
    #[error("block `{block}` in `@{func}` uses an undefined value")]
    UndefinedValue { func: String, block: String },
    #[error("type mismatch in block `{block}` of `@{func}`: {details}")]
    TypeMismatch {
        func: String,
        block: String,
        details: &'static str,
    },
}

/// Checks structural well-formedness of the module.
pub fn verify(module: &Module) -> Result<(), VerifyError> {
    let mut symbols = HashSet::default();
    let names = module
        .globals
        .iter()
        .map(|global| global.name.as_str())
        .chain(module.functions.iter().map(|func| func.name.as_str()));
    for name in names {
        if !symbols.insert(name) {
            return Err(VerifyError::DuplicateSymbol(name.to_owned()));
        }
    }

    for func in &module.functions {
        verify_function(module, func)?;
    }
    Ok(())
}

fn verify_function(module: &Module, func: &Function) -> Result<(), VerifyError> {
    let mut block_names = HashSet::default();
    for block in &func.blocks {
        if !block_names.insert(block.name.as_str()) {
            return Err(VerifyError::DuplicateBlock {
                func: func.name.clone(),
                block: block.name.clone(),
            });
        }
    }

    let defined = func
        .blocks
        .iter()
        .flat_map(|block| block.insts.iter().filter_map(Inst::dest))
        .filter(|dest| dest.index() < func.locals.len())
        .collect::<HashSet<_>>();

    for block in &func.blocks {
        let err_ctx = || (func.name.clone(), block.name.clone());
        let mismatch = |details| {
            let (func, block) = err_ctx();
            VerifyError::TypeMismatch {
                func,
                block,
                details,
            }
        };

        match block.insts.iter().position(Inst::is_terminator) {
            None => {
                let (func, block) = err_ctx();
                return Err(VerifyError::MissingTerminator { func, block });
            }
            Some(i) if i + 1 != block.insts.len() => {
                let (func, block) = err_ctx();
                return Err(VerifyError::InstAfterTerminator { func, block });
            }
            Some(_) => {}
        }

        for inst in &block.insts {
            for value in inst.operands() {
                let known = match value {
                    Value::Const { .. } => true,
                    Value::Local(id) => defined.contains(&id),
                    Value::Global(id) => id.index() < module.globals.len(),
                };
                if !known {
                    let (func, block) = err_ctx();
                    return Err(VerifyError::UndefinedValue { func, block });
                }
            }

            let ty = |value| func.value_type(value).unwrap_or(Type::Void);
            match inst {
                Inst::Alloca { ty: slot, .. } => {
                    if *slot == Type::Void {
                        return Err(mismatch("alloca of void"));
                    }
                }
                Inst::Load { ty: loaded, ptr, .. } => {
                    if ty(*ptr) != Type::Ptr {
                        return Err(mismatch("load from a non-pointer"));
                    }
                    if *loaded == Type::Void {
                        return Err(mismatch("load of void"));
                    }
                }
                Inst::Store { value, ptr } => {
                    if ty(*ptr) != Type::Ptr {
                        return Err(mismatch("store to a non-pointer"));
                    }
                    if ty(*value) == Type::Void {
                        return Err(mismatch("store of void"));
                    }
                }
                Inst::Binary { dest, lhs, rhs, .. } => {
                    let lhs = ty(*lhs);
                    if !lhs.is_int() || lhs != ty(*rhs) {
                        return Err(mismatch("binary operands must be integers of one type"));
                    }
                    if ty(Value::Local(*dest)) != lhs {
                        return Err(mismatch("binary result type differs from operands"));
                    }
                }
                Inst::ICmp { dest, lhs, rhs, .. } => {
                    let lhs = ty(*lhs);
                    if !lhs.is_int() || lhs != ty(*rhs) {
                        return Err(mismatch("icmp operands must be integers of one type"));
                    }
                    if ty(Value::Local(*dest)) != Type::I1 {
                        return Err(mismatch("icmp result must be i1"));
                    }
                }
                Inst::Br(target) => {
                    if target.index() >= func.blocks.len() {
                        let (func, block) = err_ctx();
                        return Err(VerifyError::UnknownBlock { func, block });
                    }
                }
                Inst::Unreachable => {}
            }
        }
    }

    Ok(())
}
