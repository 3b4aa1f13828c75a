// Event bus
//
// Listeners register for one event type and are called in registration order
// when that type is fired. Payloads are a fixed 16-byte block that can be
// read as whichever lane width the event uses.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    MouseMoved,
    MouseClicked,
    MouseReleased,
    MouseScrolled,
    KeyDown,
    KeyReleased,
    KeyPressed,
    WindowResize,
    WindowClose,
    WindowMoved,
}

/// 16 bytes of event payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventContext {
    bytes: [u8; 16],
}

impl EventContext {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self { bytes }
    }

    pub fn from_u16s(values: [u16; 8]) -> Self {
        Self::from_bytes(bytemuck::cast(values))
    }

    pub fn from_u32s(values: [u32; 4]) -> Self {
        Self::from_bytes(bytemuck::cast(values))
    }

    pub fn from_f32s(values: [f32; 4]) -> Self {
        Self::from_bytes(bytemuck::cast(values))
    }

    /// Resize payload: width in lane 0, height in lane 1.
    pub fn window_size(width: u32, height: u32) -> Self {
        Self::from_u32s([width, height, 0, 0])
    }

    #[cfg(test)]
    pub fn as_bytes(&self) -> [u8; 16] {
        self.bytes
    }

    pub fn as_u16s(&self) -> [u16; 8] {
        bytemuck::cast(self.bytes)
    }

    pub fn as_u32s(&self) -> [u32; 4] {
        bytemuck::cast(self.bytes)
    }

    pub fn as_f32s(&self) -> [f32; 4] {
        bytemuck::cast(self.bytes)
    }
}

/// Opaque identity of whoever fired an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Returns whether the listener handled the event. Every listener is called
/// regardless.
pub type Callback = Box<dyn FnMut(Option<SenderId>, &EventContext, EventType) -> bool>;

struct Listener {
    id: ListenerId,
    event_type: EventType,
    callback: Callback,
}

#[derive(Default)]
pub struct EventBus {
    listeners: Vec<Listener>,
    next_id: u64,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, event_type: EventType, callback: F) -> ListenerId
    where
        F: FnMut(Option<SenderId>, &EventContext, EventType) -> bool + 'static,
    {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners.push(Listener {
            id,
            event_type,
            callback: Box::new(callback),
        });
        log::trace!("Registered listener {:?} for {:?}", id, event_type);
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unregister(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|listener| listener.id != id);
        before != self.listeners.len()
    }

    /// Call every listener registered for `event_type`. Returns how many ran.
    pub fn fire(
        &mut self,
        sender: Option<SenderId>,
        context: &EventContext,
        event_type: EventType,
    ) -> usize {
        let mut called = 0;
        for listener in &mut self.listeners {
            if listener.event_type == event_type {
                (listener.callback)(sender, context, event_type);
                called += 1;
            }
        }
        called
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_context_lanes_share_bytes() {
        let context = EventContext::window_size(1920, 1080);
        assert_eq!(context.as_u32s(), [1920, 1080, 0, 0]);
        assert_eq!(&context.as_bytes()[..4], &1920u32.to_ne_bytes());

        let floats = EventContext::from_f32s([1.5, -2.0, 0.0, 4.25]);
        assert_eq!(floats.as_f32s(), [1.5, -2.0, 0.0, 4.25]);
        assert_eq!(floats.as_u32s()[0], 1.5f32.to_bits());

        let buttons = EventContext::from_u16s([2, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(buttons.as_u16s()[0], 2);
    }

    #[test]
    fn test_fire_calls_matching_listeners_in_order() {
        let mut bus = EventBus::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        for name in ["first", "second"] {
            let log = log.clone();
            bus.register(EventType::WindowResize, move |_, context, _| {
                log.borrow_mut().push((name, context.as_u32s()[0]));
                true
            });
        }
        let other = log.clone();
        bus.register(EventType::KeyPressed, move |_, _, _| {
            other.borrow_mut().push(("key", 0));
            true
        });

        let called = bus.fire(None, &EventContext::window_size(800, 600), EventType::WindowResize);

        assert_eq!(called, 2);
        assert_eq!(*log.borrow(), vec![("first", 800), ("second", 800)]);
    }

    #[test]
    fn test_unregister() {
        let mut bus = EventBus::new();
        let count = Rc::new(RefCell::new(0));

        let counter = count.clone();
        let id = bus.register(EventType::WindowClose, move |_, _, _| {
            *counter.borrow_mut() += 1;
            true
        });

        assert_eq!(bus.fire(Some(SenderId(1)), &EventContext::default(), EventType::WindowClose), 1);
        assert!(bus.unregister(id));
        assert!(!bus.unregister(id));
        assert_eq!(bus.fire(None, &EventContext::default(), EventType::WindowClose), 0);
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn test_listener_sees_sender() {
        let mut bus = EventBus::new();
        let seen = Rc::new(RefCell::new(None));

        let slot = seen.clone();
        bus.register(EventType::MouseMoved, move |sender, _, _| {
            *slot.borrow_mut() = sender;
            false
        });
        bus.fire(Some(SenderId(42)), &EventContext::default(), EventType::MouseMoved);

        assert_eq!(*seen.borrow(), Some(SenderId(42)));
    }
}
