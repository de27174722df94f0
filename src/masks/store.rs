//! Form catalogue and persistence.
//!
//! The store owns the in-memory form list and mirrors every structural
//! mutation into a persistence backend. The backend is a narrow trait
//! (delete/insert/select rows keyed by `(image_id, form_id)`), so callers
//! bring whatever database they have; [`MemoryFormsDb`] is the built-in
//! table used by tests and headless tools.

use std::time::{SystemTime, UNIX_EPOCH};

use ahash::HashSet;
use smallvec::SmallVec;

use crate::error::StoreError;
use crate::masks::blob;
use crate::masks::{Form, FormId, FormShape, FormState, GroupRef};

/// Opacity step applied by [`FormStore::change_opacity`].
const OPACITY_STEP: f32 = 0.05;

/// Reassigned ids start here when a tentative id collides.
const FIRST_REASSIGNED_ID: FormId = 100;

/// One persisted row, the §-table shape: payload is a native-endian packed
/// record blob, `payload_count` the number of records inside.
#[derive(Debug, Clone, PartialEq)]
pub struct FormRow {
    pub image_id: i64,
    pub form_id: FormId,
    pub type_bits: u32,
    pub name: String,
    pub version: i32,
    pub payload: Vec<u8>,
    pub payload_count: u32,
    pub source: [f32; 2],
}

/// The persistence contract the store drives. Implementations back it with
/// prepared statements over a real table; ordering of `select_all` must be
/// insertion order.
pub trait FormsDb: Send {
    fn delete(&mut self, image_id: i64, form_id: FormId) -> Result<(), StoreError>;
    fn delete_all(&mut self, image_id: i64) -> Result<(), StoreError>;
    fn insert(&mut self, row: FormRow) -> Result<(), StoreError>;
    fn select_all(&self, image_id: i64) -> Result<Vec<FormRow>, StoreError>;
}

/// In-memory table backend.
#[derive(Default)]
pub struct MemoryFormsDb {
    rows: Vec<FormRow>,
}

impl MemoryFormsDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self, image_id: i64) -> usize {
        self.rows.iter().filter(|r| r.image_id == image_id).count()
    }
}

impl FormsDb for MemoryFormsDb {
    fn delete(&mut self, image_id: i64, form_id: FormId) -> Result<(), StoreError> {
        self.rows
            .retain(|r| !(r.image_id == image_id && r.form_id == form_id));
        Ok(())
    }

    fn delete_all(&mut self, image_id: i64) -> Result<(), StoreError> {
        self.rows.retain(|r| r.image_id != image_id);
        Ok(())
    }

    fn insert(&mut self, row: FormRow) -> Result<(), StoreError> {
        self.rows.push(row);
        Ok(())
    }

    fn select_all(&self, image_id: i64) -> Result<Vec<FormRow>, StoreError> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.image_id == image_id)
            .cloned()
            .collect())
    }
}

pub struct FormStore {
    image_id: i64,
    forms: Vec<Form>,
    db: Box<dyn FormsDb>,
    session_counter: FormId,
}

impl FormStore {
    pub fn new(image_id: i64, db: Box<dyn FormsDb>) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as FormId)
            .unwrap_or(FIRST_REASSIGNED_ID);
        Self {
            image_id,
            forms: Vec::new(),
            db,
            session_counter: seed,
        }
    }

    pub fn image_id(&self) -> i64 {
        self.image_id
    }

    pub fn forms(&self) -> &[Form] {
        &self.forms
    }

    /// Allocate a new form with a tentative session id. The id becomes
    /// final once the form is added (collisions are resolved then).
    pub fn create(&mut self, shape: FormShape, is_clone: bool) -> Form {
        self.session_counter += 1;
        Form {
            id: self.session_counter,
            name: String::new(),
            version: 1,
            is_clone,
            source: [0.0, 0.0],
            shape,
        }
    }

    /// Resolve id collisions against the current list. Reassignment walks
    /// up from a fixed base with a running set of used ids, which gives
    /// the same result as rescanning for non-colliding inputs.
    pub fn check_id(&self, form: &mut Form) {
        let used: HashSet<FormId> = self.forms.iter().map(|f| f.id).collect();
        if !used.contains(&form.id) {
            return;
        }
        let mut candidate = FIRST_REASSIGNED_ID;
        while used.contains(&candidate) {
            candidate += 1;
        }
        form.id = candidate;
    }

    pub fn get(&self, id: FormId) -> Option<&Form> {
        self.forms.iter().find(|f| f.id == id)
    }

    pub fn get_mut(&mut self, id: FormId) -> Option<&mut Form> {
        self.forms.iter_mut().find(|f| f.id == id)
    }

    fn row_of(&self, form: &Form) -> FormRow {
        let (payload, payload_count) = blob::encode(&form.shape);
        FormRow {
            image_id: self.image_id,
            form_id: form.id,
            type_bits: blob::type_bits(&form.shape, form.is_clone),
            name: form.name.clone(),
            version: form.version,
            payload,
            payload_count,
            source: form.source,
        }
    }

    /// Upsert one form's row.
    pub fn write(&mut self, id: FormId) -> Result<(), StoreError> {
        let Some(form) = self.forms.iter().find(|f| f.id == id) else {
            return Err(StoreError::MissingRow {
                image_id: self.image_id,
                form_id: id,
            });
        };
        let row = self.row_of(form);
        self.db.delete(self.image_id, id)?;
        self.db.insert(row)
    }

    /// Drop every row of this image and reinsert the whole list.
    pub fn write_all(&mut self) -> Result<(), StoreError> {
        self.db.delete_all(self.image_id)?;
        let rows: Vec<FormRow> = self.forms.iter().map(|f| self.row_of(f)).collect();
        for row in rows {
            self.db.insert(row)?;
        }
        Ok(())
    }

    /// Purge the in-memory list and reload everything for this image.
    pub fn read_all(&mut self) -> Result<(), StoreError> {
        self.forms.clear();
        for row in self.db.select_all(self.image_id)? {
            let shape = blob::decode(row.type_bits, &row.payload, row.payload_count)?;
            self.forms.push(Form {
                id: row.form_id,
                name: row.name,
                version: row.version,
                is_clone: row.type_bits & blob::TYPE_CLONE != 0,
                source: row.source,
                shape,
            });
        }
        Ok(())
    }

    /// Would putting `form_id` inside `group_id` close a reference cycle?
    fn creates_cycle(&self, group_id: FormId, form_id: FormId) -> bool {
        if group_id == form_id {
            return true;
        }
        let Some(form) = self.get(form_id) else {
            return false;
        };
        match form.group_refs() {
            Some(refs) => refs
                .iter()
                .any(|r| self.creates_cycle(group_id, r.form_id)),
            None => false,
        }
    }

    /// Add a freshly created form to the catalogue and attach it to a mask
    /// group. With `group = None` a new group is created around it (the
    /// way a module's first mask arrives). Returns `(form_id, group_id)`.
    pub fn attach(
        &mut self,
        mut form: Form,
        group: Option<FormId>,
    ) -> Result<(FormId, FormId), StoreError> {
        self.check_id(&mut form);
        let form_id = form.id;
        let is_clone = form.is_clone;

        if form.name.is_empty() {
            let nb = self.forms.len() + 1;
            form.name = match form.shape {
                FormShape::Circle(_) => format!("circle #{nb}"),
                FormShape::Path(_) => format!("path #{nb}"),
                FormShape::Group(_) => format!("grp #{nb}"),
            };
        }
        self.forms.push(form);
        self.write(form_id)?;

        let group_id = match group.filter(|id| self.get(*id).is_some_and(Form::is_group)) {
            Some(id) => id,
            None => {
                let mut grp = self.create(FormShape::Group(SmallVec::new()), is_clone);
                self.check_id(&mut grp);
                grp.name = format!("grp #{}", self.forms.len() + 1);
                let id = grp.id;
                self.forms.push(grp);
                id
            }
        };

        if self.creates_cycle(group_id, form_id) {
            return Err(StoreError::Corrupt(format!(
                "form {form_id} would close a group cycle through {group_id}"
            )));
        }

        let image_id = self.image_id;
        let grp = self
            .get_mut(group_id)
            .and_then(Form::group_refs_mut)
            .ok_or(StoreError::MissingRow {
                image_id,
                form_id: group_id,
            })?;
        let mut state = FormState::SHOW | FormState::USE;
        if !grp.is_empty() {
            state |= FormState::UNION;
        }
        grp.push(GroupRef {
            form_id,
            parent_id: group_id,
            state,
            opacity: 1.0,
        });
        self.write(group_id)?;
        Ok((form_id, group_id))
    }

    /// Unlink `form_id` from one group; an emptied group cascades into a
    /// full removal of the group itself.
    pub fn remove_from_group(
        &mut self,
        group_id: FormId,
        form_id: FormId,
    ) -> Result<(), StoreError> {
        let Some(refs) = self.get_mut(group_id).and_then(Form::group_refs_mut) else {
            return Ok(());
        };
        let before = refs.len();
        refs.retain(|r| r.form_id != form_id);
        let now_empty = refs.is_empty();
        if refs.len() == before {
            return Ok(());
        }
        self.db.delete(self.image_id, form_id)?;
        self.write(group_id)?;
        if now_empty {
            self.remove(group_id)?;
        }
        Ok(())
    }

    /// Permanently delete a form: drop it from every group in the
    /// document (cascading groups that become empty), then from the master
    /// list, then rewrite the table.
    pub fn remove(&mut self, form_id: FormId) -> Result<(), StoreError> {
        let mut emptied: Vec<FormId> = Vec::new();
        for form in &mut self.forms {
            if let Some(refs) = form.group_refs_mut() {
                let before = refs.len();
                refs.retain(|r| r.form_id != form_id);
                if refs.len() != before && refs.is_empty() {
                    emptied.push(form.id);
                }
            }
        }
        self.forms.retain(|f| f.id != form_id);
        self.write_all()?;
        for group_id in emptied {
            self.remove(group_id)?;
        }
        Ok(())
    }

    /// Flatten `group_id`'s subtree into `dest_group_id`: leaf references
    /// are copied in walk order with state and opacity preserved.
    pub fn ungroup(&mut self, dest_group_id: FormId, group_id: FormId) -> Result<(), StoreError> {
        let mut flat: Vec<GroupRef> = Vec::new();
        self.collect_leaves(group_id, dest_group_id, &mut flat);
        let image_id = self.image_id;
        let Some(dest) = self.get_mut(dest_group_id).and_then(Form::group_refs_mut) else {
            return Err(StoreError::MissingRow {
                image_id,
                form_id: dest_group_id,
            });
        };
        dest.extend(flat);
        self.write(dest_group_id)
    }

    fn collect_leaves(&self, group_id: FormId, dest_id: FormId, out: &mut Vec<GroupRef>) {
        let Some(refs) = self.get(group_id).and_then(Form::group_refs) else {
            return;
        };
        for r in refs.to_vec() {
            match self.get(r.form_id) {
                Some(child) if child.is_group() => self.collect_leaves(r.form_id, dest_id, out),
                Some(_) => out.push(GroupRef {
                    parent_id: dest_id,
                    ..r
                }),
                None => {}
            }
        }
    }

    /// Step a reference's opacity up or down. Stays a no-op whenever the
    /// step would leave `[0,1]`; group references themselves are immutable.
    pub fn change_opacity(
        &mut self,
        form_id: FormId,
        parent_id: FormId,
        up: bool,
    ) -> Result<(), StoreError> {
        if self.get(form_id).map(Form::is_group).unwrap_or(true) {
            return Ok(());
        }
        let amount = if up { OPACITY_STEP } else { -OPACITY_STEP };
        let Some(refs) = self.get_mut(parent_id).and_then(Form::group_refs_mut) else {
            return Ok(());
        };
        let mut changed = false;
        if let Some(r) = refs.iter_mut().find(|r| r.form_id == form_id) {
            let next = r.opacity + amount;
            if (0.0..=1.0).contains(&next) {
                r.opacity = next;
                changed = true;
            }
        }
        if changed {
            self.write(parent_id)?;
        }
        Ok(())
    }

    /// Move a reference one slot towards the front (`up`) or back of its
    /// group.
    pub fn form_move(&mut self, group_id: FormId, form_id: FormId, up: bool) -> Result<(), StoreError> {
        let Some(refs) = self.get_mut(group_id).and_then(Form::group_refs_mut) else {
            return Ok(());
        };
        let Some(pos) = refs.iter().position(|r| r.form_id == form_id) else {
            return Ok(());
        };
        if up && pos == 0 || !up && pos + 1 == refs.len() {
            return Ok(());
        }
        let target = if up { pos - 1 } else { pos + 1 };
        refs.swap(pos, target);
        self.write(group_id)
    }
}
