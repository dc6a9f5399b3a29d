//! Backward liveness over a small flow graph.
//!
//! The EIR builder records, per owner, a graph of basic blocks holding
//! `Use`/`Def`/`Site` events in evaluation order. The variables live right
//! after a `Site` event are exactly what its continuation must carry.

use std::collections::BTreeSet;

use crate::hir::LocalId;

/// A variable tracked by liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Var {
    /// The handler-stack reference of the owner.
    Handlers,
    Local(LocalId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Use(Var),
    Def(Var),
    /// A continuation site, by index into the owner's site list.
    Site(usize),
}

pub type BlockId = usize;

#[derive(Debug, Clone, Default)]
pub struct Block {
    pub events: Vec<Event>,
    pub succs: Vec<BlockId>,
}

/// Control flow graph of one owner. Block 0 is the entry, block 1 the exit.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    pub blocks: Vec<Block>,
}

pub const ENTRY: BlockId = 0;
pub const EXIT: BlockId = 1;

impl Default for FlowGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowGraph {
    pub fn new() -> Self {
        Self {
            blocks: vec![Block::default(), Block::default()],
        }
    }

    pub fn new_block(&mut self) -> BlockId {
        self.blocks.push(Block::default());
        self.blocks.len() - 1
    }

    pub fn edge(&mut self, from: BlockId, to: BlockId) {
        let succs = &mut self.blocks[from].succs;
        if !succs.contains(&to) {
            succs.push(to);
        }
    }

    pub fn push(&mut self, block: BlockId, event: Event) {
        self.blocks[block].events.push(event);
    }

    /// Live-after sets of every site, indexed like the owner's site list.
    pub fn live_after_sites(&self, site_count: usize) -> Vec<BTreeSet<Var>> {
        let live_in = self.solve();
        let mut out = vec![BTreeSet::new(); site_count];
        for block in &self.blocks {
            let mut live = live_out(block, &live_in);
            for event in block.events.iter().rev() {
                match event {
                    Event::Use(v) => {
                        live.insert(*v);
                    }
                    Event::Def(v) => {
                        live.remove(v);
                    }
                    Event::Site(index) => {
                        if let Some(slot) = out.get_mut(*index) {
                            *slot = live.clone();
                        }
                    }
                }
            }
        }
        out
    }

    fn solve(&self) -> Vec<BTreeSet<Var>> {
        let mut live_in = vec![BTreeSet::new(); self.blocks.len()];
        let mut changed = true;
        while changed {
            changed = false;
            for (id, block) in self.blocks.iter().enumerate().rev() {
                let mut live = live_out(block, &live_in);
                for event in block.events.iter().rev() {
                    match event {
                        Event::Use(v) => {
                            live.insert(*v);
                        }
                        Event::Def(v) => {
                            live.remove(v);
                        }
                        Event::Site(_) => {}
                    }
                }
                if live != live_in[id] {
                    live_in[id] = live;
                    changed = true;
                }
            }
        }
        live_in
    }
}

fn live_out(block: &Block, live_in: &[BTreeSet<Var>]) -> BTreeSet<Var> {
    let mut out = BTreeSet::new();
    for succ in &block.succs {
        out.extend(live_in[*succ].iter().copied());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(i: u32) -> Var {
        Var::Local(LocalId::new(i))
    }

    #[test]
    fn test_straight_line() {
        let mut g = FlowGraph::new();
        g.push(ENTRY, Event::Def(local(0)));
        g.push(ENTRY, Event::Def(local(1)));
        g.push(ENTRY, Event::Site(0));
        g.push(ENTRY, Event::Use(local(0)));
        g.edge(ENTRY, EXIT);
        let live = g.live_after_sites(1);
        assert!(live[0].contains(&local(0)));
        assert!(!live[0].contains(&local(1)));
    }

    #[test]
    fn test_loop_carries_variable_around_back_edge() {
        let mut g = FlowGraph::new();
        let header = g.new_block();
        let body = g.new_block();
        let after = g.new_block();
        g.push(ENTRY, Event::Def(local(0)));
        g.edge(ENTRY, header);
        g.push(header, Event::Use(local(1)));
        g.edge(header, body);
        g.edge(header, after);
        g.push(body, Event::Site(0));
        g.push(body, Event::Use(local(0)));
        g.push(body, Event::Def(local(0)));
        g.edge(body, header);
        g.edge(after, EXIT);
        let live = g.live_after_sites(1);
        assert!(live[0].contains(&local(0)));
        assert!(live[0].contains(&local(1)));
    }

    #[test]
    fn test_exit_uses_reach_back() {
        let mut g = FlowGraph::new();
        g.push(ENTRY, Event::Site(0));
        g.edge(ENTRY, EXIT);
        g.push(EXIT, Event::Use(local(4)));
        let live = g.live_after_sites(1);
        assert_eq!(live[0].len(), 1);
    }
}
