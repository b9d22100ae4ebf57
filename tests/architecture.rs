//! Architecture Verification Suite
//!
//! Shared components must cross task boundaries, and the engine must only
//! see its collaborators through their traits.

#[cfg(test)]
mod architecture_tests {
    use std::sync::Arc;

    use endpoint_evolution::capabilities::{Capability, CapabilityRegistry, CapabilitySet};
    use endpoint_evolution::generation::{GenerationClient, LLMProvider, LlmGenerationClient};
    use endpoint_evolution::lifecycle::{DramaLog, LifecycleEngine, LifecycleStore};
    use endpoint_evolution::sandbox::{Sandbox, ScriptSandbox};

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_shared_state_is_thread_safe() {
        assert_send_sync::<LifecycleEngine>();
        assert_send_sync::<LifecycleStore>();
        assert_send_sync::<DramaLog>();
        assert_send_sync::<CapabilityRegistry>();
        assert_send_sync::<CapabilitySet>();
        assert_send_sync::<LlmGenerationClient>();
        assert_send_sync::<ScriptSandbox>();
    }

    #[test]
    fn test_collaborators_are_trait_objects() {
        assert_send_sync::<Arc<dyn GenerationClient>>();
        assert_send_sync::<Arc<dyn LLMProvider>>();
        assert_send_sync::<Arc<dyn Sandbox>>();
        assert_send_sync::<Arc<dyn Capability>>();
    }

    #[test]
    fn test_engine_is_cheap_to_share() {
        fn assert_clone<T: Clone + 'static>() {}
        assert_clone::<LifecycleEngine>();
    }
}
