/// Returned by event handlers. `Halt` stops delivery to the handlers registered after
/// the one returning it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventResult {
    Continue,
    Halt,
}

impl Default for EventResult {
    fn default() -> Self {
        EventResult::Continue
    }
}

pub type ListenerId = usize;

type Handler<E> = Box<dyn FnMut(&E) -> EventResult + Send>;

/// Handlers for events of type `E`, called in registration order.
pub struct Listeners<E> {
    handlers: Vec<(ListenerId, Handler<E>)>,
    next_id: ListenerId,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Listeners {
            handlers: Vec::new(),
            next_id: 0,
        }
    }
}

impl<E> Listeners<E> {
    pub fn new() -> Listeners<E> {
        Listeners::default()
    }

    pub fn add<F>(&mut self, handler: F) -> ListenerId
    where
        F: FnMut(&E) -> EventResult + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.handlers.push((id, Box::new(handler)));
        id
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(h, _)| *h != id);
        before != self.handlers.len()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Deliver `event`, returning `Halt` if some handler stopped the delivery.
    pub fn publish(&mut self, event: &E) -> EventResult {
        for (_, handler) in self.handlers.iter_mut() {
            if handler(event) == EventResult::Halt {
                return EventResult::Halt;
            }
        }
        EventResult::Continue
    }
}

impl<E> std::fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Listeners({})", self.handlers.len())
    }
}
