use std::sync::Arc;

use anyhow::{anyhow, Result};
use data_model::{
    Allocation,
    Container,
    ContainerId,
    ContainerState,
    OperatorRef,
    ResourceRequirements,
};
use serde::Serialize;
use state_store::{ContainerJournal, ReplaySummary};
use streamgrid_utils::get_epoch_time_in_ms;
use tracing::{info, warn};

pub mod sequence;

pub use sequence::ContainerSequence;

/// An outstanding ask to the cluster resource manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceRequest {
    pub container_id: ContainerId,
    pub priority: i32,
    pub memory_mb: i32,
    pub vcores: i32,
}

/// Registry of the containers of one plan instance.
///
/// Every transition that recovery depends on is journaled before the call
/// returns. Creation is not journaled: a rebuilt plan recreates the same ids
/// and priorities in the same order.
pub struct PhysicalPlan {
    sequence: ContainerSequence,
    containers: Vec<Container>,
    journal: Option<Arc<ContainerJournal>>,
    next_priority: i32,
}

impl Default for PhysicalPlan {
    fn default() -> Self {
        Self::new(None)
    }
}

impl PhysicalPlan {
    pub fn new(journal: Option<Arc<ContainerJournal>>) -> Self {
        Self {
            sequence: ContainerSequence::new(),
            containers: Vec::new(),
            journal,
            next_priority: 0,
        }
    }

    pub fn containers(&self) -> &[Container] {
        &self.containers
    }

    pub fn container(&self, id: ContainerId) -> Option<&Container> {
        self.containers.iter().find(|c| c.id() == id)
    }

    pub fn container_mut(&mut self, id: ContainerId) -> Option<&mut Container> {
        self.containers.iter_mut().find(|c| c.id() == id)
    }

    fn existing_mut(&mut self, id: ContainerId) -> Result<&mut Container> {
        self.container_mut(id)
            .ok_or_else(|| anyhow!("container {} not found", id))
    }

    fn write_journal(journal: &Option<Arc<ContainerJournal>>, container: &Container) -> Result<()> {
        if let Some(journal) = journal {
            journal.write(container)?;
        }
        Ok(())
    }

    /// Adds a NEW container asking for `requirements` under a fresh priority.
    pub fn new_container(&mut self, requirements: ResourceRequirements) -> ContainerId {
        let mut container = Container::new(self.sequence.next_id());
        container.required_memory_mb = requirements.memory_mb;
        container.required_vcores = requirements.vcores;
        container.resource_request_priority = self.next_priority;
        self.next_priority += 1;
        let id = container.id();
        self.containers.push(container);
        id
    }

    pub fn assign_operator(&mut self, id: ContainerId, operator: OperatorRef) -> Result<()> {
        self.existing_mut(id)?.add_operator(operator);
        Ok(())
    }

    /// Matches a grant to the NEW container waiting on its priority.
    ///
    /// Returns `None` for grants nothing is waiting on, e.g. a duplicate
    /// delivered after a restart.
    pub fn on_container_allocated(&mut self, allocation: &Allocation) -> Result<Option<ContainerId>> {
        let Some(container) = self.containers.iter_mut().find(|c| {
            c.state() == ContainerState::New && c.resource_request_priority == allocation.priority
        }) else {
            warn!(
                priority = allocation.priority,
                external_id = %allocation.external_id,
                "no pending request for grant"
            );
            return Ok(None);
        };
        container.allocate(allocation);
        Self::write_journal(&self.journal, container)?;
        info!(
            container = %container.to_id_state_string(),
            host = %allocation.host,
            "container allocated"
        );
        Ok(Some(container.id()))
    }

    pub fn on_container_started(&mut self, id: ContainerId) -> Result<()> {
        let journal = self.journal.clone();
        let container = self.existing_mut(id)?;
        container.set_state(ContainerState::Active);
        container.started_time = Some(get_epoch_time_in_ms());
        Self::write_journal(&journal, container)?;
        info!(container = %container.to_id_state_string(), "container started");
        Ok(())
    }

    pub fn on_container_killed(&mut self, id: ContainerId) -> Result<()> {
        let journal = self.journal.clone();
        let container = self.existing_mut(id)?;
        container.set_state(ContainerState::Killed);
        container.finished_time = Some(get_epoch_time_in_ms());
        Self::write_journal(&journal, container)?;
        info!(container = %container.to_id_state_string(), "container killed");
        Ok(())
    }

    /// Creates the successor of a killed container under a new id and
    /// priority, carrying its requirements and operators.
    pub fn replace_killed(&mut self, id: ContainerId) -> Result<ContainerId> {
        let killed = self
            .container(id)
            .ok_or_else(|| anyhow!("container {} not found", id))?;
        if killed.state() != ContainerState::Killed {
            return Err(anyhow!(
                "container {} is {}, only killed containers are replaced",
                id,
                killed.state()
            ));
        }
        let requirements = killed.requirements();
        let operators = killed.operators().to_vec();
        let restart_attempts = killed.restart_attempts + 1;

        let replacement = self.new_container(requirements);
        let container = self.existing_mut(replacement)?;
        container.restart_attempts = restart_attempts;
        for operator in operators {
            container.add_operator(operator);
        }
        info!(
            killed = %id,
            replacement = %replacement,
            restart_attempts,
            "replacing killed container"
        );
        Ok(replacement)
    }

    /// Requests still waiting for a grant.
    pub fn pending_requests(&self) -> Vec<ResourceRequest> {
        self.containers
            .iter()
            .filter(|c| c.state() == ContainerState::New)
            .map(|c| ResourceRequest {
                container_id: c.id(),
                priority: c.resource_request_priority,
                memory_mb: c.required_memory_mb,
                vcores: c.required_vcores,
            })
            .collect()
    }

    /// Replays the journal into the rebuilt container set. Must run before
    /// any resource request is issued.
    pub fn recover(&mut self) -> Result<ReplaySummary> {
        let journal = self
            .journal
            .clone()
            .ok_or_else(|| anyhow!("no container journal configured"))?;
        let containers = &mut self.containers;
        let summary = journal.replay(|record| {
            match containers.iter_mut().find(|c| c.id() == record.container_id) {
                Some(container) => record.apply(container),
                None => false,
            }
        })?;

        if let Some(max) = self.containers.iter().map(|c| c.resource_request_priority).max() {
            self.next_priority = self.next_priority.max(max + 1);
        }
        info!(
            pending = self.pending_requests().len(),
            next_priority = self.next_priority,
            "physical plan recovered"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::{mock_allocation, TEST_EXTERNAL_ID, TEST_HOST};
    use state_store::{driver::memory::MemoryJournal, JournalBackend, JournalConfig};

    use super::*;

    const REQUIREMENTS: ResourceRequirements = ResourceRequirements {
        memory_mb: 1024,
        vcores: 2,
    };

    fn plan_with_journal(journal: &Arc<ContainerJournal>) -> PhysicalPlan {
        let mut plan = PhysicalPlan::new(Some(journal.clone()));
        for _ in 0..3 {
            plan.new_container(REQUIREMENTS);
        }
        plan
    }

    #[test]
    fn test_ids_and_priorities_are_sequential() {
        let mut plan = PhysicalPlan::default();
        let first = plan.new_container(REQUIREMENTS);
        let second = plan.new_container(REQUIREMENTS);
        assert_eq!(first, ContainerId::new(1));
        assert_eq!(second, ContainerId::new(2));
        assert_eq!(plan.container(second).unwrap().resource_request_priority, 1);
        assert_eq!(plan.pending_requests().len(), 2);
    }

    #[test]
    fn test_grant_matched_by_priority() {
        let mut plan = PhysicalPlan::default();
        plan.new_container(REQUIREMENTS);
        let target = plan.new_container(REQUIREMENTS);

        let matched = plan.on_container_allocated(&mock_allocation(1)).unwrap();
        assert_eq!(matched, Some(target));
        let container = plan.container(target).unwrap();
        assert_eq!(container.id(), target);
        assert_eq!(container.state(), ContainerState::Allocated);
        assert_eq!(container.external_id.as_deref(), Some(TEST_EXTERNAL_ID));
        assert_eq!(container.host.as_deref(), Some(TEST_HOST));

        // The same grant again has nothing left to match.
        assert_eq!(plan.on_container_allocated(&mock_allocation(1)).unwrap(), None);
        assert_eq!(plan.on_container_allocated(&mock_allocation(9)).unwrap(), None);
        assert_eq!(
            plan.pending_requests(),
            vec![ResourceRequest {
                container_id: ContainerId::new(1),
                priority: 0,
                memory_mb: 1024,
                vcores: 2,
            }]
        );
    }

    #[test]
    fn test_start_kill_and_replace() {
        let mut plan = PhysicalPlan::default();
        let id = plan.new_container(REQUIREMENTS);
        plan.assign_operator(id, OperatorRef::new(4, "counter")).unwrap();
        plan.on_container_allocated(&mock_allocation(0)).unwrap();

        assert!(plan.replace_killed(id).is_err());

        plan.on_container_started(id).unwrap();
        assert_eq!(plan.container(id).unwrap().state(), ContainerState::Active);
        assert!(plan.container(id).unwrap().started_time.is_some());

        plan.on_container_killed(id).unwrap();
        let killed = plan.container(id).unwrap();
        assert_eq!(killed.state(), ContainerState::Killed);
        assert!(killed.finished_time.is_some());

        let replacement = plan.replace_killed(id).unwrap();
        assert_ne!(replacement, id);
        let container = plan.container(replacement).unwrap();
        assert_eq!(container.state(), ContainerState::New);
        assert_eq!(container.restart_attempts, 1);
        assert_eq!(container.resource_request_priority, 1);
        assert_eq!(container.requirements(), REQUIREMENTS);
        assert_eq!(container.operators(), &[OperatorRef::new(4, "counter")]);
        // The killed container is left as it was.
        assert_eq!(plan.container(id).unwrap().state(), ContainerState::Killed);

        assert!(plan.on_container_started(ContainerId::new(99)).is_err());
    }

    #[test]
    fn test_recover_skips_satisfied_requests() {
        let journal = Arc::new(ContainerJournal::new(Box::new(MemoryJournal::new())));
        let mut before = plan_with_journal(&journal);
        let first = before.on_container_allocated(&mock_allocation(0)).unwrap().unwrap();
        before.on_container_allocated(&mock_allocation(2)).unwrap();
        before.on_container_started(first).unwrap();

        let mut after = plan_with_journal(&journal);
        assert_eq!(after.pending_requests().len(), 3);
        let summary = after.recover().unwrap();
        assert_eq!(summary.applied, 3);
        assert_eq!(summary.skipped(), 0);

        let pending = after.pending_requests();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].priority, 1);
        assert_eq!(pending[0].container_id, ContainerId::new(2));

        let recovered = after.container(first).unwrap();
        assert_eq!(recovered.state(), ContainerState::Active);
        assert_eq!(recovered.external_id.as_deref(), Some(TEST_EXTERNAL_ID));
        assert_eq!(
            recovered.buffer_server_address,
            before.container(first).unwrap().buffer_server_address
        );

        // New containers do not reuse a recovered priority.
        let fresh = after.new_container(REQUIREMENTS);
        assert_eq!(after.container(fresh).unwrap().resource_request_priority, 3);
    }

    #[test]
    fn test_recover_ignores_pruned_containers() {
        let journal = Arc::new(ContainerJournal::new(Box::new(MemoryJournal::new())));
        let mut before = plan_with_journal(&journal);
        before.on_container_allocated(&mock_allocation(2)).unwrap();

        let mut after = PhysicalPlan::new(Some(journal));
        after.new_container(REQUIREMENTS);
        let summary = after.recover().unwrap();
        assert_eq!(summary.applied, 0);
        assert_eq!(summary.unmatched, 1);
        assert_eq!(after.pending_requests().len(), 1);
    }

    #[test]
    fn test_recover_from_file_journal() {
        let dir = tempfile::tempdir().unwrap();
        let config = JournalConfig {
            backend: JournalBackend::File,
            path: dir.path().to_path_buf(),
            sync_on_append: false,
        };
        {
            let journal = Arc::new(ContainerJournal::open(&config).unwrap());
            let mut plan = plan_with_journal(&journal);
            plan.on_container_allocated(&mock_allocation(1)).unwrap();
        }
        let journal = Arc::new(ContainerJournal::open(&config).unwrap());
        let mut plan = plan_with_journal(&journal);
        plan.recover().unwrap();
        assert_eq!(
            plan.container(ContainerId::new(2)).unwrap().state(),
            ContainerState::Allocated
        );
    }

    #[test]
    fn test_recover_without_journal_fails() {
        let mut plan = PhysicalPlan::default();
        assert!(plan.recover().is_err());
    }
}
