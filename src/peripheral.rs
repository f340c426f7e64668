//! The expansion bus: slot-indexed peripherals plus a second,
//! string-addressed class of "message devices" used for higher-level
//! inter-component communication. Both classes are registered by type
//! name so a hibernation snapshot can rehydrate them without the restoring
//! process knowing their concrete types up front.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

/// Number of expansion-bus slots, each addressable as 16 bytes (8 words).
pub const SLOT_COUNT: usize = 16;

/// A device attached to the expansion bus. `step` is called once per CPU
/// step, before instruction dispatch, so anything it does to raise an
/// interrupt is visible to that step's dispatch.
pub trait Peripheral: Send {
    fn read16(&mut self, offset: u8) -> u16;
    fn write16(&mut self, offset: u8, value: u16);

    /// Called once per CPU step, before instruction dispatch. `trigger`
    /// raises this peripheral's own interrupt bit; the CPU supplies it
    /// bound to this peripheral's slot so a peripheral never needs to
    /// hold a reference back to the CPU to ask for an interrupt.
    fn step(&mut self, trigger: &mut dyn FnMut());

    fn type_name(&self) -> &'static str;

    /// Serializes any state needed to resume after hibernation. The
    /// default means "nothing to save".
    fn save_state(&self) -> Option<Vec<u8>> {
        None
    }

    fn load_state(&mut self, _data: &[u8]) {}
}

/// A peripheral with no state and no behavior, used to fill unused slots
/// during tests and as the default before anything is attached.
pub struct NullPeripheral;

impl Peripheral for NullPeripheral {
    fn read16(&mut self, _offset: u8) -> u16 {
        0
    }
    fn write16(&mut self, _offset: u8, _value: u16) {}
    fn step(&mut self, _trigger: &mut dyn FnMut()) {}
    fn type_name(&self) -> &'static str {
        "null"
    }
}

type PeripheralFactory = dyn Fn() -> Box<dyn Peripheral> + Send + Sync;

static PERIPHERAL_REGISTRY: Lazy<Mutex<HashMap<String, Box<PeripheralFactory>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Registers a peripheral factory under `type_name`. A later call with the
/// same name replaces the earlier registration.
pub fn register_peripheral<F>(type_name: &str, factory: F)
where
    F: Fn() -> Box<dyn Peripheral> + Send + Sync + 'static,
{
    PERIPHERAL_REGISTRY
        .lock()
        .unwrap()
        .insert(type_name.to_string(), Box::new(factory));
}

pub fn instantiate_peripheral(type_name: &str) -> Option<Box<dyn Peripheral>> {
    PERIPHERAL_REGISTRY
        .lock()
        .unwrap()
        .get(type_name)
        .map(|factory| factory())
}

/// An outbound message, either addressed to another message device or to
/// the out-of-process sink when the target is unknown.
#[derive(Clone, Debug)]
pub struct Message {
    pub to: String,
    pub body: Vec<u8>,
}

/// A reply sink handed to a message device's `handle_message`. Devices
/// enqueue outbound traffic through it rather than addressing the bus
/// directly, so they stay decoupled from how dispatch is implemented.
pub struct Reply<'a> {
    queue: &'a mut Vec<Message>,
}

impl<'a> Reply<'a> {
    pub fn send(&mut self, to: &str, body: Vec<u8>) {
        self.queue.push(Message {
            to: to.to_string(),
            body,
        });
    }
}

pub trait MessageDevice: Send {
    fn handle_message(&mut self, reply: &mut Reply, sender: &str, body: &[u8]);
    fn type_name(&self) -> &'static str;

    fn save_state(&self) -> Option<Vec<u8>> {
        None
    }

    fn load_state(&mut self, _data: &[u8]) {}
}

type MessageDeviceFactory = dyn Fn() -> Box<dyn MessageDevice> + Send + Sync;

static MESSAGE_DEVICE_REGISTRY: Lazy<Mutex<HashMap<String, Box<MessageDeviceFactory>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub fn register_message_device<F>(type_name: &str, factory: F)
where
    F: Fn() -> Box<dyn MessageDevice> + Send + Sync + 'static,
{
    MESSAGE_DEVICE_REGISTRY
        .lock()
        .unwrap()
        .insert(type_name.to_string(), Box::new(factory));
}

pub fn instantiate_message_device(type_name: &str) -> Option<Box<dyn MessageDevice>> {
    MESSAGE_DEVICE_REGISTRY
        .lock()
        .unwrap()
        .get(type_name)
        .map(|factory| factory())
}

/// The sink that receives messages addressed to unknown targets.
pub const OUT_OF_PROCESS_SINK: &str = "out-of-process";

/// Routing table for addressed message devices, plus an outbound queue
/// for anything a device's `handle_message` enqueues.
pub struct MessageBus {
    devices: HashMap<String, Box<dyn MessageDevice>>,
    outbound: Vec<Message>,
}

impl MessageBus {
    pub fn new() -> Self {
        MessageBus {
            devices: HashMap::new(),
            outbound: Vec::new(),
        }
    }

    pub fn attach(&mut self, address: &str, device: Box<dyn MessageDevice>) {
        self.devices.insert(address.to_string(), device);
    }

    pub fn detach(&mut self, address: &str) -> Option<Box<dyn MessageDevice>> {
        self.devices.remove(address)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    /// Dispatches `body` from `sender` to `target`. If `target` is not
    /// attached, the message is forwarded to the out-of-process sink
    /// instead of erroring.
    pub fn dispatch(&mut self, sender: &str, target: &str, body: Vec<u8>) {
        match self.devices.get_mut(target) {
            Some(device) => {
                let mut reply = Reply {
                    queue: &mut self.outbound,
                };
                device.handle_message(&mut reply, sender, &body);
            }
            None => self.outbound.push(Message {
                to: OUT_OF_PROCESS_SINK.to_string(),
                body,
            }),
        }
    }

    pub fn drain_outbound(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outbound)
    }

    pub fn type_name_of(&self, address: &str) -> Option<&'static str> {
        self.devices.get(address).map(|d| d.type_name())
    }

    pub fn save_state_of(&self, address: &str) -> Option<Vec<u8>> {
        self.devices.get(address).and_then(|d| d.save_state())
    }

    pub fn load_state_into(&mut self, address: &str, data: &[u8]) {
        if let Some(d) = self.devices.get_mut(address) {
            d.load_state(data);
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;
    impl MessageDevice for Echo {
        fn handle_message(&mut self, reply: &mut Reply, sender: &str, body: &[u8]) {
            reply.send(sender, body.to_vec());
        }
        fn type_name(&self) -> &'static str {
            "echo"
        }
    }

    #[test]
    fn unknown_target_forwards_to_sink() {
        let mut bus = MessageBus::new();
        bus.dispatch("system@local", "nowhere@local", vec![1, 2, 3]);
        let out = bus.drain_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, OUT_OF_PROCESS_SINK);
    }

    #[test]
    fn known_target_replies_via_reply_sink() {
        let mut bus = MessageBus::new();
        bus.attach("echo@local", Box::new(Echo));
        bus.dispatch("system@local", "echo@local", vec![9]);
        let out = bus.drain_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, "system@local");
        assert_eq!(out[0].body, vec![9]);
    }

    #[test]
    fn registry_last_write_wins() {
        register_peripheral("dup", || Box::new(NullPeripheral));
        register_peripheral("dup", || Box::new(NullPeripheral));
        assert!(instantiate_peripheral("dup").is_some());
        assert!(instantiate_peripheral("does-not-exist").is_none());
    }
}
