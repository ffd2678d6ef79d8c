//! The rebuild planner: observes the emulated build, accumulates the
//! dependency edges between commands, and computes the set that must rerun
//! as a transitive closure over four edge kinds.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::env::ArtifactId;
use crate::ir::{CommandId, RefId, Scenario};
use crate::observer::{BuildObserver, InputKind, VersionInfo};

/// Why a command was marked for rerun. The first reason to reach a command
/// wins, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// The command directly observed a change.
    Changed,
    /// The command's output is needed and cannot be staged.
    OutputNeeded,
    /// The command's parent is rerunning.
    Child,
    /// A producer this command reads from is rerunning.
    InputMayChange,
}

impl Reason {
    pub fn describe(self) -> &'static str {
        match self {
            Reason::Changed => "observed a change",
            Reason::OutputNeeded => "output is needed",
            Reason::Child => "parent is rerunning",
            Reason::InputMayChange => "an input may change",
        }
    }
}

/// The rerun set, with the first-reported reason per command.
#[derive(Default)]
pub struct RebuildPlan {
    marked: BTreeMap<CommandId, Reason>,
}

impl RebuildPlan {
    pub fn must_run(&self, c: CommandId) -> bool {
        self.marked.contains_key(&c)
    }

    pub fn is_empty(&self) -> bool {
        self.marked.is_empty()
    }

    pub fn len(&self) -> usize {
        self.marked.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CommandId, Reason)> + '_ {
        self.marked.iter().map(|(&c, &r)| (c, r))
    }

    fn mark(&mut self, c: CommandId, reason: Reason) -> bool {
        use std::collections::btree_map::Entry;
        match self.marked.entry(c) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(reason);
                true
            }
        }
    }
}

/// Accumulates observations during emulation and builds the plan.
#[derive(Default)]
pub struct Planner {
    /// Stage saved versions instead of rerunning producers.
    enable_cache: bool,

    /// Commands that directly observed a change.
    changed: BTreeSet<CommandId>,
    /// Commands whose on-disk output is missing or stale and unstageable.
    output_needed: BTreeSet<CommandId>,

    /// Launch edges.
    children: HashMap<CommandId, BTreeSet<CommandId>>,
    /// producer -> consumers of its output.
    output_used_by: HashMap<CommandId, BTreeSet<CommandId>>,
    /// consumer -> producers whose output it needs and cannot stage.
    needs_output_from: HashMap<CommandId, BTreeSet<CommandId>>,
}

impl Planner {
    pub fn new(enable_cache: bool) -> Planner {
        Planner {
            enable_cache,
            ..Planner::default()
        }
    }

    pub fn plan(&self) -> RebuildPlan {
        let mut plan = RebuildPlan::default();
        for &c in &self.changed {
            self.mark(&mut plan, c, Reason::Changed);
        }
        for &c in &self.output_needed {
            self.mark(&mut plan, c, Reason::OutputNeeded);
        }
        plan
    }

    /// Mark a command and chase its edges. Each command is marked at most
    /// once, so the walk terminates.
    fn mark(&self, plan: &mut RebuildPlan, c: CommandId, reason: Reason) {
        if !plan.mark(c, reason) {
            return;
        }
        if let Some(children) = self.children.get(&c) {
            for &child in children {
                self.mark(plan, child, Reason::Child);
            }
        }
        if let Some(producers) = self.needs_output_from.get(&c) {
            for &p in producers {
                self.mark(plan, p, Reason::OutputNeeded);
            }
        }
        if let Some(consumers) = self.output_used_by.get(&c) {
            for &consumer in consumers {
                self.mark(plan, consumer, Reason::InputMayChange);
            }
        }
    }

    pub fn changed(&self) -> &BTreeSet<CommandId> {
        &self.changed
    }

    pub fn output_needed(&self) -> &BTreeSet<CommandId> {
        &self.output_needed
    }
}

impl BuildObserver for Planner {
    fn input(&mut self, c: CommandId, _a: ArtifactId, v: VersionInfo, kind: InputKind) {
        let creator = match v.creator {
            Some(p) => p,
            None => return,
        };
        // A saved version severs the dependency in both directions: the
        // consumer stages the cached value instead of tracking the producer.
        if self.enable_cache && v.can_stage {
            return;
        }
        // An existence-only dependency does not propagate reruns forward.
        if kind != InputKind::Exists {
            self.output_used_by.entry(creator).or_default().insert(c);
        }
        self.needs_output_from.entry(c).or_default().insert(creator);
    }

    fn mismatch(&mut self, c: CommandId, _scenario: Scenario, _a: ArtifactId) {
        self.changed.insert(c);
    }

    fn command_never_run(&mut self, c: CommandId) {
        self.changed.insert(c);
    }

    fn resolution_change(&mut self, c: CommandId, _ref_id: RefId, _expected: i32, _observed: i32) {
        self.changed.insert(c);
    }

    fn exit_code_change(&mut self, parent: CommandId, _child: CommandId, _expected: i32, _observed: i32) {
        self.changed.insert(parent);
    }

    fn final_mismatch(&mut self, _a: ArtifactId, creator: Option<CommandId>, can_stage: bool) {
        // Output nobody produced cannot be regenerated by rerunning.
        let creator = match creator {
            Some(c) => c,
            None => return,
        };
        if self.enable_cache && can_stage {
            return;
        }
        self.output_needed.insert(creator);
    }

    fn launch(&mut self, parent: Option<CommandId>, child: CommandId) {
        if let Some(parent) = parent {
            self.children.entry(parent).or_default().insert(child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(creator: u32, can_stage: bool) -> VersionInfo {
        VersionInfo {
            creator: Some(CommandId(creator)),
            can_stage,
        }
    }

    #[test]
    fn changed_command_pulls_in_children_and_consumers() {
        let mut p = Planner::new(false);
        p.launch(None, CommandId(0));
        p.launch(Some(CommandId(0)), CommandId(1));
        p.launch(Some(CommandId(0)), CommandId(2));
        // c2 reads output of c1.
        p.input(CommandId(2), ArtifactId(0), info(1, false), InputKind::Accessed);
        // c1 saw a change.
        p.mismatch(CommandId(1), Scenario::Build, ArtifactId(0));

        let plan = p.plan();
        assert!(plan.must_run(CommandId(1)));
        // Consumer of c1's output must rerun too.
        assert!(plan.must_run(CommandId(2)));
        // The parent saw no change itself.
        assert!(!plan.must_run(CommandId(0)));
    }

    #[test]
    fn rerunning_consumer_drags_in_unsaved_producer() {
        let mut p = Planner::new(false);
        p.input(CommandId(2), ArtifactId(0), info(1, false), InputKind::Accessed);
        p.mismatch(CommandId(2), Scenario::Build, ArtifactId(0));

        let plan = p.plan();
        assert!(plan.must_run(CommandId(2)));
        // c2 needs c1's output to run.
        assert!(plan.must_run(CommandId(1)));
    }

    /// With the cache enabled, a consumer whose input is staged does not
    /// drag in the producer, and a staged final mismatch needs no rerun.
    #[test]
    fn cache_suppresses_producer_edges() {
        let mut p = Planner::new(true);
        p.input(CommandId(2), ArtifactId(0), info(1, true), InputKind::Accessed);
        p.mismatch(CommandId(2), Scenario::Build, ArtifactId(0));
        p.final_mismatch(ArtifactId(1), Some(CommandId(3)), true);

        let plan = p.plan();
        assert!(plan.must_run(CommandId(2)));
        assert!(!plan.must_run(CommandId(1)));
        assert!(!plan.must_run(CommandId(3)));
    }

    /// The suppression also applies forward: a rerunning producer does not
    /// drag in a consumer whose input is staged.
    #[test]
    fn cache_suppresses_consumer_edges() {
        let mut p = Planner::new(true);
        p.input(CommandId(2), ArtifactId(0), info(1, true), InputKind::Accessed);
        p.mismatch(CommandId(1), Scenario::Build, ArtifactId(0));

        let plan = p.plan();
        assert!(plan.must_run(CommandId(1)));
        assert!(!plan.must_run(CommandId(2)));
    }

    #[test]
    fn parents_dictate_children() {
        let mut p = Planner::new(false);
        p.launch(Some(CommandId(0)), CommandId(1));
        p.launch(Some(CommandId(1)), CommandId(2));
        p.command_never_run(CommandId(0));

        let plan = p.plan();
        for c in 0..3 {
            assert!(plan.must_run(CommandId(c)));
        }
    }

    #[test]
    fn existence_inputs_do_not_propagate_forward() {
        let mut p = Planner::new(true);
        p.input(CommandId(2), ArtifactId(0), info(1, true), InputKind::Exists);
        p.mismatch(CommandId(1), Scenario::Build, ArtifactId(0));

        let plan = p.plan();
        assert!(plan.must_run(CommandId(1)));
        assert!(!plan.must_run(CommandId(2)));
    }

    /// The rerun set is closed under all four edge kinds: no unmarked
    /// command has an incoming Child/InputMayChange edge from the marked
    /// set, or is needed (without cache) by a marked consumer.
    #[test]
    fn plan_is_a_closed_set() {
        let mut p = Planner::new(false);
        // A small random-ish graph.
        for parent in 0..4u32 {
            for child in (parent + 1)..5 {
                if (parent + child) % 2 == 0 {
                    p.launch(Some(CommandId(parent)), CommandId(child));
                }
            }
        }
        for producer in 0..5u32 {
            for consumer in 0..5u32 {
                if producer != consumer && (producer * 3 + consumer) % 4 == 0 {
                    p.input(
                        CommandId(consumer),
                        ArtifactId(0),
                        info(producer, false),
                        InputKind::Accessed,
                    );
                }
            }
        }
        p.mismatch(CommandId(0), Scenario::Build, ArtifactId(0));
        p.final_mismatch(ArtifactId(1), Some(CommandId(4)), false);

        let plan = p.plan();
        for (&parent, children) in &p.children {
            if plan.must_run(parent) {
                for &child in children {
                    assert!(plan.must_run(child), "child edge left the set open");
                }
            }
        }
        for (&producer, consumers) in &p.output_used_by {
            if plan.must_run(producer) {
                for &consumer in consumers {
                    assert!(plan.must_run(consumer), "consumer edge left the set open");
                }
            }
        }
        for (&consumer, producers) in &p.needs_output_from {
            if plan.must_run(consumer) {
                for &producer in producers {
                    assert!(plan.must_run(producer), "producer edge left the set open");
                }
            }
        }
    }
}
