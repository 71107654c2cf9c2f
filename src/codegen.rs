//! Native code generation through Cranelift.
//!
//! A verified [`ir::Module`] is translated into a Cranelift object module:
//! declarations become imports, byte arrays become data objects and every
//! stack slot of a definition becomes an explicit Cranelift stack slot.
//! Cranelift's own verifier runs on each translated function.

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{
    types, AbiParam, InstBuilder, MemFlags, Signature, StackSlot, StackSlotData, StackSlotKind,
    TrapCode, UserFuncName,
};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_module::{DataDescription, DataId, Module as _, ModuleError};
use cranelift_object::{ObjectBuilder, ObjectModule};

use crate::ir::{self, BinOp, Inst, IntPredicate, Linkage, Type};

/// Trap raised by blocks which must never be entered.
const UNREACHABLE_TRAP: u8 = 1;

/// Translated module.
pub struct NativeModule {
    /// Textual Cranelift IR of every defined function.
    pub clif: String,
    /// Relocatable object file for the host target.
    pub object: Vec<u8>,
}

#[derive(thiserror::Error, Debug)]
pub enum CodegenError {
    #[error("unsupported host target: {0}")]
    Target(String),
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error("function `{func}` failed native verification:\n{errors}")]
    Verify { func: String, errors: String },
    #[error("{ty} has no native representation in `{func}`")]
    UnsupportedType { func: String, ty: Type },
    #[error("value used before definition in `{func}`")]
    UndefinedValue { func: String },
    #[error("failed to emit object: {0}")]
    Emit(String),
}

/// Translates the module into an object file for the host.
pub fn emit(module: &ir::Module) -> Result<NativeModule, CodegenError> {
    let mut codegen = Codegen::new(&module.name)?;
    codegen.declare_data(module)?;
    codegen.declare_functions(module)?;

    let mut clif = String::new();
    for (index, func) in module.functions.iter().enumerate() {
        if !func.is_declaration() {
            let id = codegen.funcs[index];
            codegen.define_function(func, id, &mut clif)?;
        }
    }

    let object = codegen
        .obj
        .finish()
        .emit()
        .map_err(|e| CodegenError::Emit(e.to_string()))?;
    Ok(NativeModule { clif, object })
}

struct Codegen {
    obj: ObjectModule,
    data: Vec<DataId>,
    funcs: Vec<cranelift_module::FuncId>,
}

impl Codegen {
    fn new(name: &str) -> Result<Self, CodegenError> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("is_pic", "true")
            .map_err(|e| CodegenError::Target(e.to_string()))?;

        let isa = cranelift_native::builder()
            .map_err(|e| CodegenError::Target(e.to_owned()))?
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| CodegenError::Target(e.to_string()))?;

        let builder = ObjectBuilder::new(isa, name, cranelift_module::default_libcall_names())?;
        Ok(Self {
            obj: ObjectModule::new(builder),
            data: Vec::new(),
            funcs: Vec::new(),
        })
    }

    fn declare_data(&mut self, module: &ir::Module) -> Result<(), CodegenError> {
        for global in &module.globals {
            let linkage = match global.linkage {
                Linkage::External => cranelift_module::Linkage::Export,
                Linkage::Private => cranelift_module::Linkage::Local,
            };
            let id = self
                .obj
                .declare_data(&global.name, linkage, !global.constant, false)?;

            let mut desc = DataDescription::new();
            desc.define(global.init.clone().into_boxed_slice());
            self.obj.define_data(id, &desc)?;

            tracing::trace!(name = %global.name, len = global.init.len(), "native data");
            self.data.push(id);
        }
        Ok(())
    }

    fn declare_functions(&mut self, module: &ir::Module) -> Result<(), CodegenError> {
        for func in &module.functions {
            let linkage = if func.is_declaration() {
                cranelift_module::Linkage::Import
            } else {
                match func.linkage {
                    Linkage::External => cranelift_module::Linkage::Export,
                    Linkage::Private => cranelift_module::Linkage::Local,
                }
            };
            let sig = self.signature(func)?;
            let id = self.obj.declare_function(&func.name, linkage, &sig)?;
            self.funcs.push(id);
        }
        Ok(())
    }

    fn signature(&self, func: &ir::Function) -> Result<Signature, CodegenError> {
        let mut sig = self.obj.make_signature();
        for &param in &func.params {
            sig.params.push(AbiParam::new(self.clif_type(func, param)?));
        }
        if func.ret != Type::Void {
            sig.returns.push(AbiParam::new(self.clif_type(func, func.ret)?));
        }
        Ok(sig)
    }

    fn clif_type(&self, func: &ir::Function, ty: Type) -> Result<types::Type, CodegenError> {
        match ty {
            // Cranelift has no 1-bit integers, comparisons produce `i8`.
            Type::I1 | Type::I8 => Ok(types::I8),
            Type::I32 => Ok(types::I32),
            Type::Ptr => Ok(self.obj.target_config().pointer_type()),
            Type::Void | Type::Bytes(_) => Err(CodegenError::UnsupportedType {
                func: func.name.clone(),
                ty,
            }),
        }
    }

    fn slot_size(&self, ty: Type) -> u32 {
        match ty {
            Type::Void => 0,
            Type::I1 | Type::I8 => 1,
            Type::I32 => 4,
            Type::Ptr => self.obj.target_config().pointer_bytes() as u32,
            Type::Bytes(len) => len as u32,
        }
    }

    fn define_function(
        &mut self,
        func: &ir::Function,
        id: cranelift_module::FuncId,
        clif: &mut String,
    ) -> Result<(), CodegenError> {
        let mut ctx = self.obj.make_context();
        ctx.func.signature = self.signature(func)?;
        ctx.func.name = UserFuncName::user(0, id.as_u32());

        let mut builder_ctx = FunctionBuilderContext::new();
        let mut b = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);

        let blocks = func
            .blocks
            .iter()
            .map(|_| b.create_block())
            .collect::<Vec<_>>();
        if let Some(&entry) = blocks.first() {
            b.append_block_params_for_function_params(entry);
        }

        let mut locals = vec![None; func.locals.len()];
        for (block, &target) in func.blocks.iter().zip(&blocks) {
            b.switch_to_block(target);
            for inst in &block.insts {
                let mut t = FunctionTranslator {
                    codegen: self,
                    func,
                    locals: &mut locals,
                };
                t.translate(&mut b, inst, &blocks)?;
            }
        }
        b.seal_all_blocks();
        b.finalize();

        cranelift_codegen::verify_function(&ctx.func, self.obj.isa().flags()).map_err(|e| {
            CodegenError::Verify {
                func: func.name.clone(),
                errors: e.to_string(),
            }
        })?;
        clif.push_str(&ctx.func.display().to_string());

        tracing::debug!(func = %func.name, blocks = func.blocks.len(), "native function");
        self.obj.define_function(id, &mut ctx)?;
        self.obj.clear_context(&mut ctx);
        Ok(())
    }
}

/// Storage behind an IR local.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Stack(StackSlot),
    Value(cranelift_codegen::ir::Value),
}

struct FunctionTranslator<'a> {
    codegen: &'a mut Codegen,
    func: &'a ir::Function,
    locals: &'a mut Vec<Option<Slot>>,
}

impl FunctionTranslator<'_> {
    fn translate(
        &mut self,
        b: &mut FunctionBuilder<'_>,
        inst: &Inst,
        blocks: &[cranelift_codegen::ir::Block],
    ) -> Result<(), CodegenError> {
        match *inst {
            Inst::Alloca { dest, ty } => {
                let size = self.codegen.slot_size(ty);
                let slot =
                    b.create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, size, 0));
                self.locals[dest.index()] = Some(Slot::Stack(slot));
            }
            Inst::Load { dest, ty, ptr } => {
                let ty = self.codegen.clif_type(self.func, ty)?;
                let value = match self.slot(ptr)? {
                    Some(Slot::Stack(slot)) => b.ins().stack_load(ty, slot, 0),
                    _ => {
                        let addr = self.value(b, ptr)?;
                        b.ins().load(ty, MemFlags::new(), addr, 0)
                    }
                };
                self.locals[dest.index()] = Some(Slot::Value(value));
            }
            Inst::Store { value, ptr } => {
                let value = self.value(b, value)?;
                match self.slot(ptr)? {
                    Some(Slot::Stack(slot)) => {
                        b.ins().stack_store(value, slot, 0);
                    }
                    _ => {
                        let addr = self.value(b, ptr)?;
                        b.ins().store(MemFlags::new(), value, addr, 0);
                    }
                }
            }
            Inst::Binary { dest, op, lhs, rhs } => {
                let lhs = self.value(b, lhs)?;
                let rhs = self.value(b, rhs)?;
                let value = match op {
                    BinOp::Add => b.ins().iadd(lhs, rhs),
                    BinOp::Sub => b.ins().isub(lhs, rhs),
                };
                self.locals[dest.index()] = Some(Slot::Value(value));
            }
            Inst::ICmp {
                dest,
                pred,
                lhs,
                rhs,
            } => {
                let lhs = self.value(b, lhs)?;
                let rhs = self.value(b, rhs)?;
                let cc = match pred {
                    IntPredicate::Eq => IntCC::Equal,
                    IntPredicate::Slt => IntCC::SignedLessThan,
                };
                let value = b.ins().icmp(cc, lhs, rhs);
                self.locals[dest.index()] = Some(Slot::Value(value));
            }
            Inst::Br(target) => {
                b.ins().jump(blocks[target.index()], &[]);
            }
            Inst::Unreachable => {
                b.ins().trap(TrapCode::unwrap_user(UNREACHABLE_TRAP));
            }
        }
        Ok(())
    }

    fn slot(&self, value: ir::Value) -> Result<Option<Slot>, CodegenError> {
        match value {
            ir::Value::Local(id) => match self.locals.get(id.index()).copied().flatten() {
                Some(slot) => Ok(Some(slot)),
                None => Err(self.undefined()),
            },
            ir::Value::Const { .. } | ir::Value::Global(_) => Ok(None),
        }
    }

    fn value(
        &mut self,
        b: &mut FunctionBuilder<'_>,
        value: ir::Value,
    ) -> Result<cranelift_codegen::ir::Value, CodegenError> {
        let ptr_ty = self.codegen.obj.target_config().pointer_type();
        match value {
            ir::Value::Const { ty, bits } => {
                let ty = self.codegen.clif_type(self.func, ty)?;
                Ok(b.ins().iconst(ty, bits as i64))
            }
            ir::Value::Local(_) => match self.slot(value)? {
                Some(Slot::Value(value)) => Ok(value),
                Some(Slot::Stack(slot)) => Ok(b.ins().stack_addr(ptr_ty, slot, 0)),
                None => Err(self.undefined()),
            },
            ir::Value::Global(id) => {
                let data = self.codegen.data[id.index()];
                let gv = self.codegen.obj.declare_data_in_func(data, b.func);
                Ok(b.ins().global_value(ptr_ty, gv))
            }
        }
    }

    fn undefined(&self) -> CodegenError {
        CodegenError::UndefinedValue {
            func: self.func.name.clone(),
        }
    }
}
