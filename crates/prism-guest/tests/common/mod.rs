#![allow(dead_code)] // Not every test binary uses every helper.

//! Shared harness: a scripted device model on the other side of the shared
//! region.
//!
//! The mock device reacts synchronously inside the doorbell write, which
//! makes the blocking paths in the session deterministic to test: by the
//! time a submit path waits on an event, the "device" has already signalled
//! it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use prism_guest::notify::Event;
use prism_guest::ring::RingChannel;
use prism_guest::session::DeviceSession;
use prism_guest::shmem::{Doorbell, SharedMemory, SharedRam};
use prism_protocol::info::{DeviceInfoDesc, MainSlotInfo, PRISM_DEVICE_INFO_VERSION};
use prism_protocol::irq::PendingBits;
use prism_protocol::ports;
use prism_protocol::ring::{CommandDesc, CursorDesc};

pub const CMD_RING_OFFSET: u64 = 0x100;
pub const CURSOR_RING_OFFSET: u64 = 0x300;
pub const RELEASE_RING_OFFSET: u64 = 0x500;
pub const INT_PENDING_OFFSET: u64 = 0x10;
pub const INT_MASK_OFFSET: u64 = 0x14;
pub const SLOTS_GENERATION_OFFSET: u64 = 0x18;

pub const CMD_RING_CAPACITY: u32 = 4;

pub fn test_info() -> DeviceInfoDesc {
    DeviceInfoDesc {
        version: PRISM_DEVICE_INFO_VERSION,
        io_base: 0x1C80,
        cmd_ring_offset: CMD_RING_OFFSET,
        cursor_ring_offset: CURSOR_RING_OFFSET,
        release_ring_offset: RELEASE_RING_OFFSET,
        int_pending_offset: INT_PENDING_OFFSET,
        int_mask_offset: INT_MASK_OFFSET,
        slots_generation_offset: SLOTS_GENERATION_OFFSET,
        slot_range_start_offset: 0x20,
        slot_range_end_offset: 0x28,
        primary_create_offset: 0x40,
        slot_id_bits: 8,
        slot_gen_bits: 8,
        num_slots: 4,
        main_slot_id: 0,
        main_slot: MainSlotInfo {
            generation: 1,
            phys_start: 0x1000_0000,
            phys_end: 0x1100_0000,
            virt_start: 0x7000_0000,
            virt_end: 0x7100_0000,
        },
        n_surfaces: 4,
        primary_area_offset: 0x1000,
        primary_area_size: 0x40_0000,
        vram_phys_start: 0x2000_0000,
        vram_phys_end: 0x2004_0000,
        vram_virt_start: 0x9000_0000,
    }
}

#[derive(Debug, Default)]
struct ConnectedEvents {
    display: Option<Arc<Event>>,
    cursor: Option<Arc<Event>>,
    io_cmd: Option<Arc<Event>>,
}

#[derive(Debug)]
pub struct MockDeviceState {
    ram: SharedRam,
    info: DeviceInfoDesc,
    events: ConnectedEvents,

    /// Consume commands/cursor ops as soon as the doorbell rings.
    pub auto_consume: bool,
    /// Acknowledge surface destroys from inside the doorbell write.
    pub auto_ack_destroy: bool,
    /// Signal events directly (as the interrupt controller would after
    /// dispatch). When false only `int_pending` is raised and the driver's
    /// own interrupt path must run.
    pub signal_events: bool,

    /// Release ids handed back when the guest reports device-memory
    /// pressure.
    pub oom_release_script: VecDeque<u64>,

    pub consumed_commands: Vec<CommandDesc>,
    pub consumed_cursor_ops: Vec<CursorDesc>,
    pub slots_added: Vec<(u8, u64, u64)>,
    pub slots_removed: Vec<u8>,
    pub surfaces_destroyed: Vec<u8>,
    pub primary_creates: u32,
    pub primary_destroys: u32,
    pub destroy_all_count: u32,
    pub reset_count: u32,
    pub irq_updates: u32,
}

impl MockDeviceState {
    fn raise(&mut self, bits: PendingBits) {
        let pending = self.ram.read_u32(self.info.int_pending_offset);
        self.ram
            .write_u32(self.info.int_pending_offset, pending | bits.bits());
    }

    fn signal_display(&mut self) {
        self.raise(PendingBits::DISPLAY);
        if self.signal_events {
            if let Some(ev) = &self.events.display {
                ev.signal();
            }
        }
    }

    fn signal_cursor(&mut self) {
        self.raise(PendingBits::CURSOR);
        if self.signal_events {
            if let Some(ev) = &self.events.cursor {
                ev.signal();
            }
        }
    }

    fn signal_io_cmd(&mut self) {
        self.raise(PendingBits::IO_CMD);
        if self.signal_events {
            if let Some(ev) = &self.events.io_cmd {
                ev.signal();
            }
        }
    }

    fn consume_commands(&mut self) {
        let mut ring: RingChannel<CommandDesc> =
            RingChannel::attach(&mut self.ram, self.info.cmd_ring_offset).unwrap();
        let mut got = Vec::new();
        ring.drain(&mut self.ram, |d| got.push(d)).unwrap();
        if !got.is_empty() {
            self.consumed_commands.extend(got);
            self.signal_display();
        }
    }

    fn consume_cursor_ops(&mut self) {
        let mut ring: RingChannel<CursorDesc> =
            RingChannel::attach(&mut self.ram, self.info.cursor_ring_offset).unwrap();
        let mut got = Vec::new();
        ring.drain(&mut self.ram, |d| got.push(d)).unwrap();
        if !got.is_empty() {
            self.consumed_cursor_ops.extend(got);
            self.signal_cursor();
        }
    }

    fn push_release(&mut self, id: u64) {
        let mut ring: RingChannel<u64> =
            RingChannel::attach(&mut self.ram, self.info.release_ring_offset).unwrap();
        assert!(ring.try_push(&mut self.ram, &id).unwrap(), "release ring full");
        ring.publish(&mut self.ram);
    }

    fn init_rings(&mut self) {
        RingChannel::<CommandDesc>::init(&mut self.ram, self.info.cmd_ring_offset, CMD_RING_CAPACITY)
            .unwrap();
        RingChannel::<CursorDesc>::init(&mut self.ram, self.info.cursor_ring_offset, 8).unwrap();
        RingChannel::<u64>::init(&mut self.ram, self.info.release_ring_offset, 8).unwrap();
    }

    fn on_ring(&mut self, port: u16, value: u8) {
        match port {
            ports::NOTIFY_CMD => {
                if self.auto_consume {
                    self.consume_commands();
                }
            }
            ports::NOTIFY_CURSOR => {
                if self.auto_consume {
                    self.consume_cursor_ops();
                }
            }
            ports::NOTIFY_OOM => {
                while let Some(id) = self.oom_release_script.pop_front() {
                    self.push_release(id);
                }
                self.signal_display();
            }
            ports::UPDATE_IRQ => {
                self.irq_updates += 1;
            }
            ports::MEMSLOT_ADD => {
                let start = self.ram.read_u64(self.info.slot_range_start_offset);
                let end = self.ram.read_u64(self.info.slot_range_end_offset);
                self.slots_added.push((value, start, end));
            }
            ports::MEMSLOT_DEL => {
                self.slots_removed.push(value);
            }
            ports::CREATE_PRIMARY => {
                self.primary_creates += 1;
            }
            ports::DESTROY_PRIMARY => {
                self.primary_destroys += 1;
            }
            ports::DESTROY_SURFACE_WAIT => {
                self.surfaces_destroyed.push(value);
                if self.auto_ack_destroy {
                    self.signal_io_cmd();
                }
            }
            ports::DESTROY_ALL_SURFACES => {
                self.destroy_all_count += 1;
            }
            ports::RESET => {
                self.reset_count += 1;
                let generation = self.ram.read_u32(self.info.slots_generation_offset);
                self.ram
                    .write_u32(self.info.slots_generation_offset, generation + 1);
                self.ram.write_u32(self.info.int_pending_offset, 0);
                self.init_rings();
            }
            other => panic!("unexpected doorbell port {other}"),
        }
    }
}

/// Cloneable handle; the session owns one clone as its doorbell, the test
/// keeps another to script and inspect the device.
#[derive(Clone, Debug)]
pub struct MockDevice(Arc<Mutex<MockDeviceState>>);

impl MockDevice {
    pub fn new(ram: SharedRam, info: DeviceInfoDesc) -> Self {
        let mut state = MockDeviceState {
            ram,
            info,
            events: ConnectedEvents::default(),
            auto_consume: true,
            auto_ack_destroy: true,
            signal_events: true,
            oom_release_script: VecDeque::new(),
            consumed_commands: Vec::new(),
            consumed_cursor_ops: Vec::new(),
            slots_added: Vec::new(),
            slots_removed: Vec::new(),
            surfaces_destroyed: Vec::new(),
            primary_creates: 0,
            primary_destroys: 0,
            destroy_all_count: 0,
            reset_count: 0,
            irq_updates: 0,
        };
        state.init_rings();
        state
            .ram
            .write_u32(state.info.slots_generation_offset, state.info.main_slot.generation);
        Self(Arc::new(Mutex::new(state)))
    }

    pub fn connect_events<M: SharedMemory, D: Doorbell>(&self, session: &DeviceSession<M, D>) {
        let mut state = self.0.lock().unwrap();
        state.events.display = Some(session.display_event());
        state.events.cursor = Some(session.cursor_event());
        state.events.io_cmd = Some(session.io_cmd_event());
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MockDeviceState) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }

    /// Device-side completion of an earlier submission: echo the release id
    /// and notify.
    pub fn complete_command(&self, release_id: u64) {
        let mut state = self.0.lock().unwrap();
        state.push_release(release_id);
        state.signal_display();
    }

    /// Consume whatever is published on the command ring right now.
    pub fn consume_commands_now(&self) {
        self.0.lock().unwrap().consume_commands();
    }

    /// Signal the destroy-completion for a previously deferred destroy ack.
    pub fn ack_destroy_now(&self) {
        self.0.lock().unwrap().signal_io_cmd();
    }
}

impl Doorbell for MockDevice {
    fn ring(&mut self, port: u16, value: u8) {
        self.0.lock().unwrap().on_ring(port, value);
    }
}

pub fn setup() -> (DeviceSession<SharedRam, MockDevice>, MockDevice) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let info = test_info();
    let ram = SharedRam::new(0x4000);
    let mock = MockDevice::new(ram.clone(), info.clone());
    let session =
        DeviceSession::attach(info, ram, mock.clone()).expect("attach against mock device");
    mock.connect_events(&session);
    (session, mock)
}
