//! A small SSA-style intermediate representation.
//!
//! The lowering pipeline only needs a subset of what a general purpose
//! backend IR offers: byte-array globals, function declarations, a single
//! defined function made of basic blocks, stack slots and a handful of
//! integer operations. Everything is index based, so handles stay valid while
//! the module is being built.
//!
//! Modules are serialized to an LLVM-like text form through [`Display`].
//!
//! [`Display`]: std::fmt::Display

use std::fmt;

pub use self::passes::{OptLevel, Pass, PassManager, PruneUnreachableBlocks};
pub use self::verify::{verify, VerifyError};

mod passes;
mod verify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    I1,
    I8,
    I32,
    Ptr,
    /// `[N x i8]`
    Bytes(usize),
}

impl Type {
    pub fn is_int(self) -> bool {
        matches!(self, Self::I1 | Self::I8 | Self::I32)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => f.write_str("void"),
            Self::I1 => f.write_str("i1"),
            Self::I8 => f.write_str("i8"),
            Self::I32 => f.write_str("i32"),
            Self::Ptr => f.write_str("ptr"),
            Self::Bytes(len) => write!(f, "[{len} x i8]"),
        }
    }
}

macro_rules! define_ids {
    ($($(#[$meta:meta])* $name:ident),+$(,)?) => {$(
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn index(self) -> usize {
                self.0
            }
        }
    )+};
}

define_ids! {
    /// Index of a global in its module.
    GlobalId,
    /// Index of a function in its module.
    FuncId,
    /// Index of a basic block in its function.
    BlockId,
    /// Index of a local value in its function.
    LocalId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Const { ty: Type, bits: u64 },
    Local(LocalId),
    Global(GlobalId),
}

impl Value {
    #[inline]
    pub const fn int(ty: Type, bits: u64) -> Self {
        Self::Const { ty, bits }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntPredicate {
    Eq,
    Slt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inst {
    Alloca {
        dest: LocalId,
        ty: Type,
    },
    Load {
        dest: LocalId,
        ty: Type,
        ptr: Value,
    },
    Store {
        value: Value,
        ptr: Value,
    },
    Binary {
        dest: LocalId,
        op: BinOp,
        lhs: Value,
        rhs: Value,
    },
    ICmp {
        dest: LocalId,
        pred: IntPredicate,
        lhs: Value,
        rhs: Value,
    },
    Br(BlockId),
    Unreachable,
}

impl Inst {
    pub fn is_terminator(&self) -> bool {
        matches!(self, Self::Br(_) | Self::Unreachable)
    }

    pub fn dest(&self) -> Option<LocalId> {
        match self {
            Self::Alloca { dest, .. }
            | Self::Load { dest, .. }
            | Self::Binary { dest, .. }
            | Self::ICmp { dest, .. } => Some(*dest),
            Self::Store { .. } | Self::Br(_) | Self::Unreachable => None,
        }
    }

    pub fn operands(&self) -> Vec<Value> {
        match self {
            Self::Load { ptr, .. } => vec![*ptr],
            Self::Store { value, ptr } => vec![*value, *ptr],
            Self::Binary { lhs, rhs, .. } | Self::ICmp { lhs, rhs, .. } => vec![*lhs, *rhs],
            Self::Alloca { .. } | Self::Br(_) | Self::Unreachable => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    External,
    Private,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FnAttrs {
    pub noreturn: bool,
    pub nounwind: bool,
}

#[derive(Debug, Clone)]
pub struct Global {
    pub name: String,
    pub linkage: Linkage,
    pub constant: bool,
    pub init: Vec<u8>,
}

impl Global {
    pub fn ty(&self) -> Type {
        Type::Bytes(self.init.len())
    }
}

#[derive(Debug, Clone)]
pub struct Local {
    pub name: String,
    pub ty: Type,
}

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub name: String,
    pub insts: Vec<Inst>,
    /// Entered from outside the function, passes must keep it.
    pub pinned: bool,
}

impl BasicBlock {
    pub fn is_terminated(&self) -> bool {
        self.insts.last().is_some_and(Inst::is_terminator)
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub ret: Type,
    pub params: Vec<Type>,
    pub linkage: Linkage,
    pub attrs: FnAttrs,
    pub blocks: Vec<BasicBlock>,
    pub locals: Vec<Local>,
}

impl Function {
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Appends a new block, renaming it if the name is already taken.
    pub fn append_block(&mut self, name: &str) -> BlockId {
        let name = unique_name(name, |candidate| {
            self.blocks.iter().any(|block| block.name == candidate)
        });
        self.blocks.push(BasicBlock {
            name,
            insts: Vec::new(),
            pinned: false,
        });
        BlockId(self.blocks.len() - 1)
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.0]
    }

    pub fn find_block(&self, name: &str) -> Option<BlockId> {
        self.blocks
            .iter()
            .position(|block| block.name == name)
            .map(BlockId)
    }

    /// Type of a value as seen from this function, `None` for unknown locals.
    pub fn value_type(&self, value: Value) -> Option<Type> {
        match value {
            Value::Const { ty, .. } => Some(ty),
            Value::Local(id) => self.locals.get(id.0).map(|local| local.ty),
            Value::Global(_) => Some(Type::Ptr),
        }
    }

    fn new_local(&mut self, name: Option<&str>, ty: Type) -> LocalId {
        let name = match name {
            Some(name) => unique_name(name, |candidate| {
                self.locals.iter().any(|local| local.name == candidate)
            }),
            None => format!("t{}", self.locals.len()),
        };
        self.locals.push(Local { name, ty });
        LocalId(self.locals.len() - 1)
    }
}

fn unique_name(name: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(name) {
        return name.to_owned();
    }
    let mut i = 1usize;
    loop {
        let candidate = format!("{name}.{i}");
        if !taken(&candidate) {
            return candidate;
        }
        i += 1;
    }
}

#[derive(Debug, Clone, Default)]
pub struct Module {
    pub name: String,
    pub globals: Vec<Global>,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            globals: Vec::new(),
            functions: Vec::new(),
        }
    }

    /// Adds a constant byte array.
    /// Adds a constant byte array. A name already taken by another symbol
    /// gets a `.N` suffix.
    pub fn add_global(&mut self, name: &str, linkage: Linkage, init: Vec<u8>) -> GlobalId {
        let name = unique_name(name, |candidate| self.has_symbol(candidate));
        self.globals.push(Global {
            name,
            linkage,
            constant: true,
            init,
        });
        GlobalId(self.globals.len() - 1)
    }

    pub fn add_function(
        &mut self,
        name: &str,
        ret: Type,
        params: Vec<Type>,
        linkage: Linkage,
    ) -> FuncId {
        let name = unique_name(name, |candidate| self.has_symbol(candidate));
        self.functions.push(Function {
            name,
            ret,
            params,
            linkage,
            attrs: FnAttrs::default(),
            blocks: Vec::new(),
            locals: Vec::new(),
        });
        FuncId(self.functions.len() - 1)
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.0]
    }

    pub fn function_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.0]
    }

    pub fn get_function(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|func| func.name == name)
            .map(FuncId)
    }

    pub fn global(&self, id: GlobalId) -> &Global {
        &self.globals[id.0]
    }

    pub fn get_global(&self, name: &str) -> Option<GlobalId> {
        self.globals
            .iter()
            .position(|global| global.name == name)
            .map(GlobalId)
    }

    fn has_symbol(&self, name: &str) -> bool {
        self.globals.iter().any(|global| global.name == name)
            || self.functions.iter().any(|func| func.name == name)
    }

    /// Returns a builder appending to the end of `block`.
    pub fn builder(&mut self, func: FuncId, block: BlockId) -> Builder<'_> {
        Builder {
            func: &mut self.functions[func.0],
            block,
        }
    }
}

pub struct Builder<'m> {
    func: &'m mut Function,
    block: BlockId,
}

impl Builder<'_> {
    pub fn alloca(&mut self, ty: Type, name: &str) -> Value {
        let dest = self.func.new_local(Some(name), Type::Ptr);
        self.push(Inst::Alloca { dest, ty });
        Value::Local(dest)
    }

    pub fn load(&mut self, ty: Type, ptr: Value) -> Value {
        let dest = self.func.new_local(None, ty);
        self.push(Inst::Load { dest, ty, ptr });
        Value::Local(dest)
    }

    pub fn store(&mut self, value: Value, ptr: Value) {
        self.push(Inst::Store { value, ptr });
    }

    pub fn binary(&mut self, op: BinOp, lhs: Value, rhs: Value) -> Value {
        let ty = self.func.value_type(lhs).unwrap_or(Type::Void);
        let dest = self.func.new_local(None, ty);
        self.push(Inst::Binary { dest, op, lhs, rhs });
        Value::Local(dest)
    }

    pub fn icmp(&mut self, pred: IntPredicate, lhs: Value, rhs: Value) -> Value {
        let dest = self.func.new_local(None, Type::I1);
        self.push(Inst::ICmp {
            dest,
            pred,
            lhs,
            rhs,
        });
        Value::Local(dest)
    }

    pub fn br(&mut self, target: BlockId) {
        self.push(Inst::Br(target));
    }

    pub fn unreachable(&mut self) {
        self.push(Inst::Unreachable);
    }

    fn push(&mut self, inst: Inst) {
        self.func.block_mut(self.block).insts.push(inst);
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; ModuleID = '{}'", self.name)?;

        if !self.globals.is_empty() {
            writeln!(f)?;
        }
        for global in &self.globals {
            writeln!(
                f,
                "{} = {}{} {} c\"{}\"",
                Name(Some('@'), &global.name),
                linkage_prefix(global.linkage),
                if global.constant { "constant" } else { "global" },
                global.ty(),
                Bytes(&global.init),
            )?;
        }

        for func in &self.functions {
            writeln!(f)?;
            write!(f, "{}", FunctionDisplay { module: self, func })?;
        }
        Ok(())
    }
}

struct FunctionDisplay<'a> {
    module: &'a Module,
    func: &'a Function,
}

impl FunctionDisplay<'_> {
    fn value(&self, value: Value) -> ValueDisplay<'_> {
        ValueDisplay {
            module: self.module,
            func: self.func,
            value,
        }
    }

    fn typed(&self, value: Value) -> String {
        let ty = self.func.value_type(value).unwrap_or(Type::Void);
        format!("{ty} {}", self.value(value))
    }
}

impl fmt::Display for FunctionDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let func = self.func;
        let keyword = if func.is_declaration() {
            "declare"
        } else {
            "define"
        };
        write!(
            f,
            "{keyword} {}{} {}(",
            linkage_prefix(func.linkage),
            func.ret,
            Name(Some('@'), &func.name)
        )?;
        for (i, param) in func.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{param}")?;
        }
        f.write_str(")")?;
        if func.attrs.noreturn {
            f.write_str(" noreturn")?;
        }
        if func.attrs.nounwind {
            f.write_str(" nounwind")?;
        }

        if func.is_declaration() {
            return writeln!(f);
        }

        writeln!(f, " {{")?;
        for block in &func.blocks {
            write!(f, "{}:", Name(None, &block.name))?;
            if block.pinned {
                f.write_str(" ; entry point")?;
            }
            writeln!(f)?;

            for inst in &block.insts {
                f.write_str("  ")?;
                match inst {
                    Inst::Alloca { dest, ty } => {
                        write!(f, "{} = alloca {ty}", self.value(Value::Local(*dest)))?
                    }
                    Inst::Load { dest, ty, ptr } => write!(
                        f,
                        "{} = load {ty}, {}",
                        self.value(Value::Local(*dest)),
                        self.typed(*ptr)
                    )?,
                    Inst::Store { value, ptr } => {
                        write!(f, "store {}, {}", self.typed(*value), self.typed(*ptr))?
                    }
                    Inst::Binary { dest, op, lhs, rhs } => write!(
                        f,
                        "{} = {} {}, {}",
                        self.value(Value::Local(*dest)),
                        match op {
                            BinOp::Add => "add",
                            BinOp::Sub => "sub",
                        },
                        self.typed(*lhs),
                        self.value(*rhs)
                    )?,
                    Inst::ICmp {
                        dest,
                        pred,
                        lhs,
                        rhs,
                    } => write!(
                        f,
                        "{} = icmp {} {}, {}",
                        self.value(Value::Local(*dest)),
                        match pred {
                            IntPredicate::Eq => "eq",
                            IntPredicate::Slt => "slt",
                        },
                        self.typed(*lhs),
                        self.value(*rhs)
                    )?,
                    Inst::Br(target) => match func.blocks.get(target.0) {
                        Some(target) => write!(f, "br label {}", Name(Some('%'), &target.name))?,
                        None => write!(f, "br label %<invalid {}>", target.0)?,
                    },
                    Inst::Unreachable => f.write_str("unreachable")?,
                }
                writeln!(f)?;
            }
        }
        writeln!(f, "}}")
    }
}

struct ValueDisplay<'a> {
    module: &'a Module,
    func: &'a Function,
    value: Value,
}

impl fmt::Display for ValueDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Value::Const { ty: Type::I1, bits } => {
                f.write_str(if bits & 1 == 1 { "true" } else { "false" })
            }
            Value::Const { ty, bits } => match ty {
                Type::I8 => write!(f, "{}", bits as u8 as i8),
                Type::I32 => write!(f, "{}", bits as u32 as i32),
                _ => write!(f, "{bits}"),
            },
            Value::Local(id) => match self.func.locals.get(id.0) {
                Some(local) => write!(f, "{}", Name(Some('%'), &local.name)),
                None => write!(f, "%<invalid {}>", id.0),
            },
            Value::Global(id) => match self.module.globals.get(id.0) {
                Some(global) => write!(f, "{}", Name(Some('@'), &global.name)),
                None => write!(f, "@<invalid {}>", id.0),
            },
        }
    }
}

fn linkage_prefix(linkage: Linkage) -> &'static str {
    match linkage {
        Linkage::External => "",
        Linkage::Private => "private ",
    }
}

/// Symbol with an optional sigil, quoted when it contains special characters.
struct Name<'a>(Option<char>, &'a str);

impl fmt::Display for Name<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Name(sigil, name) = *self;
        if let Some(sigil) = sigil {
            write!(f, "{sigil}")?;
        }

        let plain = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '$' | '-'));
        if plain {
            f.write_str(name)
        } else {
            write!(f, "\"{}\"", Bytes(name.as_bytes()))
        }
    }
}

/// Escaped byte string contents.
struct Bytes<'a>(&'a [u8]);

impl fmt::Display for Bytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &byte in self.0 {
            if byte == b' ' || (byte.is_ascii_graphic() && byte != b'"' && byte != b'\\') {
                write!(f, "{}", byte as char)?;
            } else {
                write!(f, "\\{byte:02X}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_names_are_unique() {
        let mut module = Module::new("test");
        let main = module.add_function("main", Type::I32, Vec::new(), Linkage::External);
        let func = module.function_mut(main);
        let a = func.append_block("loop");
        let b = func.append_block("loop");
        let c = func.append_block("loop");
        assert_eq!(func.block(a).name, "loop");
        assert_eq!(func.block(b).name, "loop.1");
        assert_eq!(func.block(c).name, "loop.2");
        assert_eq!(func.find_block("loop.1"), Some(b));
    }

    #[test]
    fn print_module() {
        let mut module = Module::new("asm_module");
        module.add_global("msg", Linkage::Private, b"hi\n\"".to_vec());
        let putchar = module.add_function("putchar", Type::I32, vec![Type::I32], Linkage::External);
        module.function_mut(putchar).attrs.nounwind = true;

        let main = module.add_function("main", Type::I32, Vec::new(), Linkage::External);
        let entry = module.function_mut(main).append_block("Entry");
        let next = module.function_mut(main).append_block("next label");
        module.function_mut(main).block_mut(next).pinned = true;

        let mut b = module.builder(main, entry);
        let a = b.alloca(Type::I8, "A");
        b.store(Value::int(Type::I8, 0xff), a);
        let loaded = b.load(Type::I8, a);
        let sum = b.binary(BinOp::Add, loaded, Value::int(Type::I8, 1));
        let neg = b.icmp(IntPredicate::Slt, sum, Value::int(Type::I8, 0));
        let flag = b.alloca(Type::I1, "S_neg");
        b.store(neg, flag);
        b.br(next);
        module.builder(main, next).unreachable();

        let expected = "\
; ModuleID = 'asm_module'

@msg = private constant [4 x i8] c\"hi\\0A\\22\"

declare i32 @putchar(i32) nounwind

define i32 @main() {
Entry:
  %A = alloca i8
  store i8 -1, ptr %A
  %t1 = load i8, ptr %A
  %t2 = add i8 %t1, 1
  %t3 = icmp slt i8 %t2, 0
  %S_neg = alloca i1
  store i1 %t3, ptr %S_neg
  br label %\"next label\"
\"next label\": ; entry point
  unreachable
}
";
        assert_eq!(module.to_string(), expected);
    }
}
