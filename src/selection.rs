use serde::Serialize;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

type Listener<T> = Box<dyn FnMut(&T)>;

/// Observable value. Listeners run synchronously inside `set`, in the order
/// they were registered.
pub struct State<T> {
    value: T,
    listeners: Vec<Listener<T>>,
}

impl<T> State<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            listeners: Vec::new(),
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn set(&mut self, value: T) {
        self.value = value;
        for listener in self.listeners.iter_mut() {
            listener(&self.value);
        }
    }

    pub fn subscribe(&mut self, listener: impl FnMut(&T) + 'static) {
        self.listeners.push(Box::new(listener));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub student_ids: BTreeSet<String>,
    pub material_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionFlags {
    pub save_returned: bool,
    pub manual_return: bool,
    pub student_list: bool,
}

pub fn action_flags(student_count: usize, material_count: usize) -> ActionFlags {
    ActionFlags {
        save_returned: material_count >= 1,
        manual_return: student_count <= 1,
        student_list: student_count >= 1,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "studentId", rename_all = "camelCase")]
pub enum ManualReturnTarget {
    /// No student selected: the caller has to pick one first.
    PickStudent,
    Student(String),
    Disabled,
}

pub fn manual_return_target(selection: &Selection) -> ManualReturnTarget {
    let mut ids = selection.student_ids.iter();
    match (ids.next(), ids.next()) {
        (None, _) => ManualReturnTarget::PickStudent,
        (Some(id), None) => ManualReturnTarget::Student(id.clone()),
        _ => ManualReturnTarget::Disabled,
    }
}

/// Selection state of the return view plus the flags derived from it.
pub struct ReturnSession {
    selection: State<Selection>,
    flags: Rc<RefCell<ActionFlags>>,
}

impl ReturnSession {
    pub fn new() -> Self {
        let mut selection = State::new(Selection::default());
        let flags = Rc::new(RefCell::new(action_flags(0, 0)));
        let derived = Rc::clone(&flags);
        selection.subscribe(move |s: &Selection| {
            let next = action_flags(s.student_ids.len(), s.material_ids.len());
            tracing::debug!(?next, "return view actions updated");
            *derived.borrow_mut() = next;
        });
        Self { selection, flags }
    }

    pub fn selection(&self) -> &Selection {
        self.selection.get()
    }

    /// Point-in-time copy used by print and return actions.
    pub fn snapshot(&self) -> Selection {
        self.selection.get().clone()
    }

    pub fn select(&mut self, selection: Selection) {
        self.selection.set(selection);
    }

    pub fn forget_materials<'a>(&mut self, ids: impl IntoIterator<Item = &'a String>) {
        let mut next = self.snapshot();
        for id in ids {
            next.material_ids.remove(id);
        }
        if &next != self.selection.get() {
            self.selection.set(next);
        }
    }

    pub fn flags(&self) -> ActionFlags {
        *self.flags.borrow()
    }
}

impl Default for ReturnSession {
    fn default() -> Self {
        Self::new()
    }
}
