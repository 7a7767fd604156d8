//! Peer service discovery and connection routing shared by the client roles.
//!
//! A client instance serves the connection whose index matches its own instance index. On a
//! new connection it either discovers the peer's service ([`Discovery`]) or takes the handles
//! the application kept from an earlier discovery ([`PeerSvc`]).
//!
//! [`Discovery`]: struct.Discovery.html
//! [`PeerSvc`]: struct.PeerSvc.html

use crate::{
    att::{AttHandle, Properties, Status, Value},
    gatt::{GattEvent, GattReq},
    kernel::{ConHdl, TaskId},
    task::Context,
    uuid::Uuid16,
};

/// Characteristics a peer service description can hold.
pub const MAX_CHARS: usize = 6;

/// Descriptors a peer service description can hold.
pub const MAX_DESCS: usize = 3;

/// A characteristic a client looks for.
#[derive(Debug, Copy, Clone)]
pub struct CharDef {
    pub uuid: u16,
    pub mandatory: bool,
    /// Properties the characteristic must have.
    pub props: Properties,
}

/// A descriptor a client looks for.
#[derive(Debug, Copy, Clone)]
pub struct DescDef {
    pub uuid: Uuid16,
    /// Index of the characteristic (in the `CharDef` list) the descriptor belongs to.
    pub char_idx: usize,
    /// Mandatory if the characteristic is present.
    pub mandatory: bool,
}

/// What a client looks for in a peer.
#[derive(Debug, Copy, Clone)]
pub struct SvcDef<'a> {
    pub uuid: u16,
    pub chars: &'a [CharDef],
    pub descs: &'a [DescDef],
}

/// A characteristic found in a peer service.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CharInfo {
    pub decl: AttHandle,
    pub value: AttHandle,
    pub props: Properties,
}

impl Default for CharInfo {
    fn default() -> Self {
        Self {
            decl: AttHandle::NULL,
            value: AttHandle::NULL,
            props: Properties::empty(),
        }
    }
}

/// Handles of a peer service, indexed like the client's `CharDef` and `DescDef` lists.
///
/// Missing entries are null.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct PeerSvc {
    pub start: AttHandle,
    pub end: AttHandle,
    pub chars: [CharInfo; MAX_CHARS],
    pub descs: [AttHandle; MAX_DESCS],
}

impl PeerSvc {
    /// Value handle of characteristic `idx`, if the peer has it.
    pub fn value(&self, idx: usize) -> Option<AttHandle> {
        self.chars
            .get(idx)
            .map(|c| c.value)
            .filter(|h| !h.is_null())
    }

    /// Handle of descriptor `idx`, if the peer has it.
    pub fn desc(&self, idx: usize) -> Option<AttHandle> {
        self.descs.get(idx).copied().filter(|h| !h.is_null())
    }

    /// Index of the characteristic whose value handle is `handle`.
    pub fn char_of(&self, handle: AttHandle) -> Option<usize> {
        if handle.is_null() {
            return None;
        }
        self.chars.iter().position(|c| c.value == handle)
    }

    /// Last handle belonging to characteristic `idx`.
    fn char_end(&self, idx: usize) -> AttHandle {
        let decl = self.chars[idx].decl;
        self.chars
            .iter()
            .map(|c| c.decl)
            .filter(|&d| !d.is_null() && d > decl)
            .min()
            .map_or(self.end, |next| AttHandle::from_raw(next.as_u16() - 1))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Step {
    Service,
    Chars,
    Descs(usize),
}

/// Where a discovery procedure stands after an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Waiting for more events.
    Pending,
    /// Next procedure to run.
    Request(GattReq),
    Done(PeerSvc),
    Failed(Status),
}

/// Discovery of one peer service: the service, its characteristics, then the descriptors of
/// every characteristic that has some to look for.
#[derive(Debug, Clone)]
pub struct Discovery {
    conhdl: ConHdl,
    step: Step,
    found: u8,
    svc: PeerSvc,
}

impl Discovery {
    /// Starts discovering `def` on `conhdl`. Returns the first request to send.
    pub fn start(conhdl: ConHdl, def: &SvcDef<'_>) -> (Self, GattReq) {
        let disc = Self {
            conhdl,
            step: Step::Service,
            found: 0,
            svc: PeerSvc::default(),
        };
        let req = GattReq::DiscoverService {
            conhdl,
            uuid: Uuid16(def.uuid),
        };
        (disc, req)
    }

    /// Feeds a GATT event to the procedure.
    pub fn handle(&mut self, evt: &GattEvent, def: &SvcDef<'_>) -> Progress {
        match (self.step, evt) {
            (Step::Service, GattEvent::ServiceFound { uuid, start, end, .. }) => {
                if *uuid == Uuid16(def.uuid) {
                    self.found = self.found.saturating_add(1);
                    if self.found == 1 {
                        self.svc.start = *start;
                        self.svc.end = *end;
                    }
                }
                Progress::Pending
            }
            (
                Step::Chars,
                GattEvent::CharFound {
                    uuid,
                    decl,
                    value,
                    props,
                    ..
                },
            ) => {
                let found = def
                    .chars
                    .iter()
                    .position(|c| *uuid == Uuid16(c.uuid))
                    .filter(|&i| i < MAX_CHARS && self.svc.chars[i].value.is_null());
                if let Some(i) = found {
                    self.svc.chars[i] = CharInfo {
                        decl: *decl,
                        value: *value,
                        props: *props,
                    };
                }
                Progress::Pending
            }
            (Step::Descs(char_idx), GattEvent::DescFound { uuid, handle, .. }) => {
                let svc = &mut self.svc;
                let slot = def.descs.iter().enumerate().position(|(j, d)| {
                    j < MAX_DESCS
                        && d.char_idx == char_idx
                        && d.uuid == *uuid
                        && svc.descs[j].is_null()
                });
                if let Some(j) = slot {
                    svc.descs[j] = *handle;
                }
                Progress::Pending
            }
            (step, GattEvent::DiscoveryCmp { status, .. }) => {
                // Running out of attributes is the normal end of a discovery procedure.
                if !status.is_ok() && *status != Status::AttributeNotFound {
                    return Progress::Failed(*status);
                }
                match step {
                    Step::Service => self.service_done(),
                    Step::Chars => match self.check_chars(def) {
                        Ok(()) => self.next_descs(def, 0),
                        Err(status) => Progress::Failed(status),
                    },
                    Step::Descs(char_idx) => self.next_descs(def, char_idx + 1),
                }
            }
            (step, other) => {
                debug!("discovery: ignoring {:?} in {:?}", other, step);
                Progress::Pending
            }
        }
    }

    fn service_done(&mut self) -> Progress {
        match self.found {
            0 => Progress::Failed(Status::StopDiscoveryCharMissing),
            1 => {
                self.step = Step::Chars;
                Progress::Request(GattReq::DiscoverChars {
                    conhdl: self.conhdl,
                    start: self.svc.start,
                    end: self.svc.end,
                })
            }
            _ => Progress::Failed(Status::MultipleService),
        }
    }

    fn check_chars(&self, def: &SvcDef<'_>) -> Result<(), Status> {
        for (info, req) in self.svc.chars.iter().zip(def.chars) {
            if info.value.is_null() {
                if req.mandatory {
                    return Err(Status::StopDiscoveryCharMissing);
                }
            } else if !info.props.contains(req.props) {
                return Err(Status::StopDiscoveryWrongCharProp);
            }
        }
        Ok(())
    }

    /// Moves on to the first characteristic from `from` on that has descriptors to look for.
    fn next_descs(&mut self, def: &SvcDef<'_>, from: usize) -> Progress {
        let svc = &self.svc;
        let next = (from..def.chars.len().min(MAX_CHARS)).find(|&i| {
            let value = svc.chars[i].value;
            !value.is_null()
                && value < svc.char_end(i)
                && def.descs.iter().any(|d| d.char_idx == i)
        });

        match next {
            Some(i) => {
                self.step = Step::Descs(i);
                Progress::Request(GattReq::DiscoverDescs {
                    conhdl: self.conhdl,
                    start: self.svc.chars[i].value.offset(1),
                    end: self.svc.char_end(i),
                })
            }
            None => {
                let missing = def.descs.iter().enumerate().any(|(j, d)| {
                    d.mandatory
                        && self.svc.value(d.char_idx).is_some()
                        && self.svc.desc(j).is_none()
                });
                if missing {
                    Progress::Failed(Status::StopDiscoveryCharMissing)
                } else {
                    Progress::Done(self.svc)
                }
            }
        }
    }
}

/// Where an `Enable` request for a connection should be handled.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Route {
    /// By the receiving instance.
    Here,
    /// By the instance serving that connection index.
    Forward(TaskId),
    /// Nowhere, the connection doesn't exist.
    Reject,
}

/// Decides which instance serves `conhdl`.
pub fn route(ctx: &Context<'_>, conhdl: ConHdl) -> Route {
    let me = ctx.id();
    match ctx.connection_index(conhdl) {
        None => Route::Reject,
        Some(idx) if idx == me.index() => Route::Here,
        Some(idx) => Route::Forward(TaskId::new(me.task_type(), idx)),
    }
}

/// A write of a client configuration descriptor.
pub fn write_cfg(conhdl: ConHdl, handle: AttHandle, cfg: u16) -> Result<GattReq, Status> {
    let value = Value::from_slice(&cfg.to_le_bytes()).map_err(|()| Status::InsufficientResources)?;
    Ok(GattReq::Write {
        conhdl,
        handle,
        value,
        response: true,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::uuid::{decl, AttUuid};

    pub const CONHDL: ConHdl = 0x0040;

    pub fn h(raw: u16) -> AttHandle {
        AttHandle::from_raw(raw)
    }

    fn chars() -> [CharDef; 3] {
        [
            CharDef {
                uuid: 0x2A5B,
                mandatory: true,
                props: Properties::NOTIFY,
            },
            CharDef {
                uuid: 0x2A5C,
                mandatory: true,
                props: Properties::READ,
            },
            CharDef {
                uuid: 0x2A55,
                mandatory: false,
                props: Properties::WRITE | Properties::INDICATE,
            },
        ]
    }

    static DESCS: [DescDef; 2] = [
        DescDef {
            uuid: decl::CLIENT_CHAR_CFG,
            char_idx: 0,
            mandatory: true,
        },
        DescDef {
            uuid: decl::CLIENT_CHAR_CFG,
            char_idx: 2,
            mandatory: true,
        },
    ];

    fn char_found(uuid: u16, decl: u16, props: Properties) -> GattEvent {
        GattEvent::CharFound {
            conhdl: CONHDL,
            uuid: AttUuid::short(uuid),
            decl: h(decl),
            value: h(decl + 1),
            props,
        }
    }

    fn cmp() -> GattEvent {
        GattEvent::DiscoveryCmp {
            conhdl: CONHDL,
            status: Status::AttributeNotFound,
        }
    }

    fn service(disc: &mut Discovery, def: &SvcDef<'_>, count: usize) -> Progress {
        for _ in 0..count {
            let found = GattEvent::ServiceFound {
                conhdl: CONHDL,
                uuid: AttUuid::short(0x1816),
                start: h(0x10),
                end: h(0x1F),
            };
            assert_eq!(disc.handle(&found, def), Progress::Pending);
        }
        disc.handle(&cmp(), def)
    }

    #[test]
    fn full_discovery() {
        let chars = chars();
        let def = SvcDef {
            uuid: 0x1816,
            chars: &chars,
            descs: &DESCS,
        };
        let (mut disc, req) = Discovery::start(CONHDL, &def);
        assert_eq!(
            req,
            GattReq::DiscoverService {
                conhdl: CONHDL,
                uuid: Uuid16(0x1816)
            }
        );

        assert_eq!(
            service(&mut disc, &def, 1),
            Progress::Request(GattReq::DiscoverChars {
                conhdl: CONHDL,
                start: h(0x10),
                end: h(0x1F)
            })
        );

        disc.handle(&char_found(0x2A5B, 0x11, Properties::NOTIFY), &def);
        disc.handle(&char_found(0x2A5C, 0x14, Properties::READ), &def);
        disc.handle(
            &char_found(0x2A55, 0x16, Properties::WRITE | Properties::INDICATE),
            &def,
        );
        assert_eq!(
            disc.handle(&cmp(), &def),
            Progress::Request(GattReq::DiscoverDescs {
                conhdl: CONHDL,
                start: h(0x13),
                end: h(0x13)
            })
        );

        let desc = |handle| GattEvent::DescFound {
            conhdl: CONHDL,
            uuid: decl::CLIENT_CHAR_CFG,
            handle: h(handle),
        };
        disc.handle(&desc(0x13), &def);
        assert_eq!(
            disc.handle(&cmp(), &def),
            Progress::Request(GattReq::DiscoverDescs {
                conhdl: CONHDL,
                start: h(0x18),
                end: h(0x1F)
            })
        );
        disc.handle(&desc(0x18), &def);

        match disc.handle(&cmp(), &def) {
            Progress::Done(svc) => {
                assert_eq!(svc.value(1), Some(h(0x15)));
                assert_eq!(svc.desc(0), Some(h(0x13)));
                assert_eq!(svc.desc(1), Some(h(0x18)));
                assert_eq!(svc.char_of(h(0x17)), Some(2));
                assert_eq!(svc.value(3), None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn service_count() {
        let chars = chars();
        let def = SvcDef {
            uuid: 0x1816,
            chars: &chars,
            descs: &DESCS,
        };
        let (mut disc, _) = Discovery::start(CONHDL, &def);
        assert_eq!(
            service(&mut disc, &def, 0),
            Progress::Failed(Status::StopDiscoveryCharMissing)
        );
        let (mut disc, _) = Discovery::start(CONHDL, &def);
        assert_eq!(service(&mut disc, &def, 2), Progress::Failed(Status::MultipleService));
    }

    #[test]
    fn characteristic_checks() {
        let chars = chars();
        let def = SvcDef {
            uuid: 0x1816,
            chars: &chars,
            descs: &DESCS,
        };

        let (mut disc, _) = Discovery::start(CONHDL, &def);
        service(&mut disc, &def, 1);
        disc.handle(&char_found(0x2A5B, 0x11, Properties::NOTIFY), &def);
        assert_eq!(
            disc.handle(&cmp(), &def),
            Progress::Failed(Status::StopDiscoveryCharMissing)
        );

        let (mut disc, _) = Discovery::start(CONHDL, &def);
        service(&mut disc, &def, 1);
        disc.handle(&char_found(0x2A5B, 0x11, Properties::NOTIFY), &def);
        disc.handle(&char_found(0x2A5C, 0x14, Properties::WRITE), &def);
        assert_eq!(
            disc.handle(&cmp(), &def),
            Progress::Failed(Status::StopDiscoveryWrongCharProp)
        );

        // The optional control point is absent, so its descriptor isn't required.
        let (mut disc, _) = Discovery::start(CONHDL, &def);
        service(&mut disc, &def, 1);
        disc.handle(&char_found(0x2A5B, 0x11, Properties::NOTIFY), &def);
        disc.handle(&char_found(0x2A5C, 0x14, Properties::READ), &def);
        disc.handle(&cmp(), &def);
        assert_eq!(
            disc.handle(&cmp(), &def),
            Progress::Failed(Status::StopDiscoveryCharMissing)
        );
    }

    #[test]
    fn failed_procedure() {
        let chars = chars();
        let def = SvcDef {
            uuid: 0x1816,
            chars: &chars,
            descs: &DESCS,
        };
        let (mut disc, _) = Discovery::start(CONHDL, &def);
        let evt = GattEvent::DiscoveryCmp {
            conhdl: CONHDL,
            status: Status::InsufficientAuthentication,
        };
        assert_eq!(
            disc.handle(&evt, &def),
            Progress::Failed(Status::InsufficientAuthentication)
        );
    }
}
