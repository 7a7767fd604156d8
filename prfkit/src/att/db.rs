use crate::{
    att::{AttHandle, AttributeDesc, PermRight, ServiceLayout, Status},
    kernel::TaskId,
    uuid::AttUuid,
};

/// A stored attribute, as returned by [`AttributeDb::get_attribute`].
///
/// [`AttributeDb::get_attribute`]: trait.AttributeDb.html#tymethod.get_attribute
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Element<'a> {
    pub handle: AttHandle,
    pub uuid: AttUuid,
    pub value: &'a [u8],
}

/// The attribute database of the BLE stack.
///
/// The database stores attribute values and permissions and serves peer reads on its own. The
/// profiles only create their services, keep values current and control per-service access.
pub trait AttributeDb {
    /// Creates a service from `table`, adding only the entries whose bit is set in `cfg`.
    ///
    /// Entry 0 must be the primary service declaration and is always created. `owner` is the task
    /// that receives write indications for the service's attributes.
    fn create_db(
        &mut self,
        table: &[AttributeDesc],
        cfg: u64,
        owner: TaskId,
    ) -> Result<ServiceLayout, Status>;

    /// Replaces the value of an attribute.
    ///
    /// Fails with `InvalidAttributeValueLength` if `value` exceeds the attribute's maximum
    /// length, or `InvalidHandle` if there is no such attribute. The stored value is not changed
    /// on failure.
    fn set_value(&mut self, handle: AttHandle, value: &[u8]) -> Result<(), Status>;

    /// Looks up an attribute.
    fn get_attribute(&self, handle: AttHandle) -> Result<Element<'_>, Status>;

    /// Sets the access level of the service declared at `svc`.
    fn set_permission(&mut self, svc: AttHandle, perm: PermRight) -> Result<(), Status>;
}
