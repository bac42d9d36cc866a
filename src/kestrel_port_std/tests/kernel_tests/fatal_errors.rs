//! Fatal errors halt the system, and the halt is reported to the thread
//! waiting on it.
//!
//! Every test boots its own kernel instance because a halted system can't
//! be restarted.

mod task_table_exhausted {
    use kestrel_kernel::{Hunk, System};

    kestrel_port_std::use_port!(unsafe struct SystemTraits);
    kestrel_kernel::build!(SystemTraits {
        tasks: 1,
        heap: 256,
        idle_stack: 256,
    });

    static STACK_A: Hunk<[u8; 256]> = Hunk::new();
    static STACK_B: Hunk<[u8; 256]> = Hunk::new();

    fn init() {
        System::<SystemTraits>::create_task("a", &STACK_A, 1, |_| {}, 0);
        System::<SystemTraits>::create_task("b", &STACK_B, 1, |_| {}, 0);
    }

    #[test]
    #[should_panic(expected = "task table exhausted")]
    fn too_many_tasks() {
        kestrel_port_std::boot::<SystemTraits>(init);
        kestrel_port_std::wait_until_idle::<SystemTraits>();
    }
}

mod stack_too_small {
    use kestrel_kernel::{Hunk, System};

    kestrel_port_std::use_port!(unsafe struct SystemTraits);
    kestrel_kernel::build!(SystemTraits {
        tasks: 1,
        heap: 256,
        idle_stack: 256,
    });

    static STACK: Hunk<[u8; 64]> = Hunk::new();

    fn init() {
        System::<SystemTraits>::create_task("a", &STACK, 1, |_| {}, 0);
    }

    #[test]
    #[should_panic(expected = "stack too small")]
    fn tiny_stack() {
        kestrel_port_std::boot::<SystemTraits>(init);
        kestrel_port_std::wait_until_idle::<SystemTraits>();
    }
}

mod message_too_large {
    use kestrel_kernel::{Hunk, Queue, System, WaitFlags, WAIT_FOREVER};

    kestrel_port_std::use_port!(unsafe struct SystemTraits);
    kestrel_kernel::build!(SystemTraits {
        tasks: 1,
        heap: 256,
        idle_stack: 256,
    });

    static QUEUE: Queue<SystemTraits> = Queue::new();
    static STACK: Hunk<[u8; 256]> = Hunk::new();

    fn init() {
        QUEUE.create(2, 4);
        System::<SystemTraits>::create_task("a", &STACK, 1, task_body, 0);
    }

    fn task_body(_: usize) {
        QUEUE.add(WaitFlags::NONE, WAIT_FOREVER, b"12345").unwrap();
    }

    #[test]
    #[should_panic(expected = "message too large")]
    fn oversized_message() {
        kestrel_port_std::boot::<SystemTraits>(init);
        kestrel_port_std::wait_until_idle::<SystemTraits>();
    }
}

mod block_in_interrupt {
    use kestrel_kernel::{Event, WaitFlags, WAIT_FOREVER};

    kestrel_port_std::use_port!(unsafe struct SystemTraits);
    kestrel_kernel::build!(SystemTraits {
        tasks: 1,
        heap: 256,
        idle_stack: 256,
    });

    const INT_LINE: usize = 5;

    static E: Event<SystemTraits> = Event::new();

    fn init() {}

    fn isr() {
        let _ = E.wait(0b1, WaitFlags::NONE, WAIT_FOREVER);
    }

    #[test]
    #[should_panic(expected = "bad context")]
    fn wait_in_isr() {
        kestrel_port_std::set_interrupt_handler::<SystemTraits>(INT_LINE, isr).unwrap();
        kestrel_port_std::boot::<SystemTraits>(init);
        kestrel_port_std::wait_until_idle::<SystemTraits>();

        kestrel_port_std::pend_interrupt_line::<SystemTraits>(INT_LINE).unwrap();
        kestrel_port_std::wait_until_idle::<SystemTraits>();
    }
}

mod double_free {
    use kestrel_kernel::{Hunk, System};

    kestrel_port_std::use_port!(unsafe struct SystemTraits);
    kestrel_kernel::build!(SystemTraits {
        tasks: 1,
        heap: 256,
        idle_stack: 256,
    });

    type Sys = System<SystemTraits>;

    static STACK: Hunk<[u8; 256]> = Hunk::new();

    fn init() {
        Sys::create_task("a", &STACK, 1, task_body, 0);
    }

    fn task_body(_: usize) {
        let p = Sys::alloc(16);
        unsafe {
            Sys::free(p);
            Sys::free(p);
        }
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn free_twice() {
        kestrel_port_std::boot::<SystemTraits>(init);
        kestrel_port_std::wait_until_idle::<SystemTraits>();
    }
}

mod empty_multiwait {
    use kestrel_kernel::{Combinator, Hunk, MultiWait, System, WAIT_FOREVER};

    kestrel_port_std::use_port!(unsafe struct SystemTraits);
    kestrel_kernel::build!(SystemTraits {
        tasks: 1,
        heap: 256,
        idle_stack: 256,
    });

    static MW: MultiWait<SystemTraits> = MultiWait::new();
    static STACK: Hunk<[u8; 256]> = Hunk::new();

    fn init() {
        MW.create(2);
        System::<SystemTraits>::create_task("a", &STACK, 1, task_body, 0);
    }

    fn task_body(_: usize) {
        let _ = MW.wait(Combinator::Or, WAIT_FOREVER);
    }

    #[test]
    #[should_panic(expected = "bad object state")]
    fn wait_without_subwaits() {
        kestrel_port_std::boot::<SystemTraits>(init);
        kestrel_port_std::wait_until_idle::<SystemTraits>();
    }
}

mod oversized_queue {
    use kestrel_kernel::Queue;

    kestrel_port_std::use_port!(unsafe struct SystemTraits);
    kestrel_kernel::build!(SystemTraits {
        tasks: 1,
        heap: 256,
        idle_stack: 256,
    });

    static QUEUE: Queue<SystemTraits> = Queue::new();

    fn init() {
        // Three bytes per slot; the ring's size is `usize::MAX`
        QUEUE.create(usize::MAX / 3, 1);
    }

    #[test]
    #[should_panic(expected = "heap exhausted")]
    fn ring_larger_than_address_space() {
        kestrel_port_std::boot::<SystemTraits>(init);
        kestrel_port_std::wait_until_idle::<SystemTraits>();
    }
}
