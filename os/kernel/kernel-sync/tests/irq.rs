use kernel_sync::irq::{IrqGuard, interrupts_enabled};

// Single test: the hosted interrupt flag is process-global.
#[test]
fn guards_nest_and_restore() {
    assert!(interrupts_enabled());

    {
        let outer = IrqGuard::new();
        assert!(outer.restores());
        assert!(!interrupts_enabled());

        {
            let inner = IrqGuard::new();
            assert!(!inner.restores());
            assert!(!interrupts_enabled());
        }

        // inner guard saw IF=0, so it must not re-enable
        assert!(!interrupts_enabled());
    }

    assert!(interrupts_enabled());
}
