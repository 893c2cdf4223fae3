use std::sync::atomic::{AtomicU32, Ordering};

use data_model::ContainerId;

/// Source of container ids for one plan instance. Ids start at 1.
#[derive(Debug, Default)]
pub struct ContainerSequence {
    last: AtomicU32,
}

impl ContainerSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> ContainerId {
        ContainerId::new(self.last.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, thread};

    use super::*;

    #[test]
    fn test_ids_are_unique_across_threads() {
        let sequence = Arc::new(ContainerSequence::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sequence = sequence.clone();
                thread::spawn(move || (0..250).map(|_| sequence.next_id()).collect::<Vec<_>>())
            })
            .collect();
        let ids: HashSet<ContainerId> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        assert_eq!(ids.len(), 1000);
        assert!(ids.contains(&ContainerId::new(1)));
        assert_eq!(sequence.next_id(), ContainerId::new(1001));
    }
}
