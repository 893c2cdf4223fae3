pub mod tests {
    use super::super::{
        Allocation,
        AllocationBuilder,
        BufferServerAddress,
        Container,
        ContainerId,
        ContainerState,
    };

    pub const TEST_EXTERNAL_ID: &str = "container_1700000000000_0001_01_000002";
    pub const TEST_HOST: &str = "node-1.cluster.local";
    pub const TEST_NODE_HTTP_ADDRESS: &str = "node-1.cluster.local:8042";
    pub const TEST_BUFFER_SERVER_PORT: u16 = 41_123;

    pub fn mock_allocation(priority: i32) -> Allocation {
        AllocationBuilder::default()
            .priority(priority)
            .external_id(TEST_EXTERNAL_ID.to_string())
            .host(TEST_HOST.to_string())
            .node_http_address(Some(TEST_NODE_HTTP_ADDRESS.to_string()))
            .memory_mb(1024)
            .vcores(2)
            .buffer_server(Some(BufferServerAddress::new(
                TEST_HOST,
                TEST_BUFFER_SERVER_PORT,
            )))
            .build()
            .unwrap()
    }

    pub fn mock_new_container(id: u32, priority: i32) -> Container {
        let mut container = Container::new(ContainerId::new(id));
        container.resource_request_priority = priority;
        container.required_memory_mb = 1024;
        container.required_vcores = 2;
        container
    }

    pub fn mock_allocated_container(id: u32, priority: i32) -> Container {
        let mut container = mock_new_container(id, priority);
        container.allocate(&mock_allocation(priority));
        assert_eq!(container.state(), ContainerState::Allocated);
        container
    }
}
