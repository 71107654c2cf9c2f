use super::{BlockId, Function, Inst, Module};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum OptLevel {
    #[default]
    None,
    Basic,
}

pub trait Pass {
    fn name(&self) -> &'static str;

    /// Returns `true` if the function was changed.
    fn run_on_function(&mut self, func: &mut Function) -> bool;
}

#[derive(Default)]
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
}

impl PassManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard pipeline for the given level. `None` runs nothing.
    pub fn for_level(level: OptLevel) -> Self {
        let mut pm = Self::new();
        if level == OptLevel::Basic {
            pm.add(PruneUnreachableBlocks);
        }
        pm
    }

    pub fn add<P: Pass + 'static>(&mut self, pass: P) {
        self.passes.push(Box::new(pass));
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Runs every pass on every defined function.
    pub fn run(&mut self, module: &mut Module) -> bool {
        let mut changed = false;
        for pass in &mut self.passes {
            for func in &mut module.functions {
                if func.is_declaration() {
                    continue;
                }
                let func_changed = pass.run_on_function(func);
                tracing::debug!(
                    pass = pass.name(),
                    function = %func.name,
                    changed = func_changed,
                    "ran pass"
                );
                changed |= func_changed;
            }
        }
        changed
    }
}

/// Removes blocks that can't be reached from the first block or any pinned block.
pub struct PruneUnreachableBlocks;

impl Pass for PruneUnreachableBlocks {
    fn name(&self) -> &'static str {
        "prune-unreachable-blocks"
    }

    fn run_on_function(&mut self, func: &mut Function) -> bool {
        let block_count = func.blocks.len();
        let mut reachable = vec![false; block_count];

        let mut stack = func
            .blocks
            .iter()
            .enumerate()
            .filter(|(i, block)| *i == 0 || block.pinned)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();

        while let Some(i) = stack.pop() {
            if std::mem::replace(&mut reachable[i], true) {
                continue;
            }
            for inst in &func.blocks[i].insts {
                if let Inst::Br(target) = inst {
                    if target.index() < block_count && !reachable[target.index()] {
                        stack.push(target.index());
                    }
                }
            }
        }

        if reachable.iter().all(|r| *r) {
            return false;
        }

        let mut remap = Vec::with_capacity(block_count);
        let mut next = 0;
        for r in &reachable {
            remap.push(r.then(|| {
                let id = BlockId(next);
                next += 1;
                id
            }));
        }

        let mut index = 0;
        func.blocks.retain(|_| {
            let keep = reachable[index];
            index += 1;
            keep
        });

        for block in &mut func.blocks {
            for inst in &mut block.insts {
                if let Inst::Br(target) = inst {
                    // Kept blocks only branch to kept blocks.
                    if let Some(Some(new)) = remap.get(target.index()) {
                        *target = *new;
                    }
                }
            }
        }

        true
    }
}
