//! SuperGroup: container of the Groups sharing one app-group name.
//! Reserved for multi-component applications; today it holds exactly one
//! default Group, but the state machine and waitlist routing stay general.

use crate::group::{Group, GroupLifeStatus, SchedulingContext};
use crate::options::Options;
use crate::pool::{Actions, GetCallback, GetWaiter, Pool};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SuperGroupState {
    /// Created; component discovery runs in the background and callers
    /// queue on the SuperGroup waitlist
    Initializing,
    Ready,
    Restarting,
    Destroying,
    Destroyed,
}

impl SuperGroupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuperGroupState::Initializing => "initializing",
            SuperGroupState::Ready => "ready",
            SuperGroupState::Restarting => "restarting",
            SuperGroupState::Destroying => "destroying",
            SuperGroupState::Destroyed => "destroyed",
        }
    }
}

/// One component of an application (today: always the default one)
#[derive(Debug, Clone)]
pub(crate) struct ComponentInfo {
    pub name: String,
    pub is_default: bool,
}

impl ComponentInfo {
    pub fn default_component() -> Self {
        Self {
            name: "default".to_string(),
            is_default: true,
        }
    }
}

pub(crate) struct SuperGroup {
    pub name: String,
    /// Opaque token admin tooling can address this SuperGroup by
    pub secret: String,
    pub state: SuperGroupState,
    pub options: Options,
    /// The application's components; parallel to `groups`
    pub components: Vec<ComponentInfo>,
    pub groups: Vec<Group>,
    /// Index of the default group in `groups`
    pub default_group: usize,
    /// Populated only while INITIALIZING; drained into the groups when
    /// initialization finishes
    pub get_waitlist: VecDeque<GetWaiter>,
    /// Bumped when the SuperGroup is reinitialized; stale background
    /// tasks compare it and bail
    pub generation: u64,
}

impl SuperGroup {
    pub fn new(name: String, secret: String, options: Options) -> Self {
        Self {
            name,
            secret,
            state: SuperGroupState::Initializing,
            options,
            components: Vec::new(),
            groups: Vec::new(),
            default_group: 0,
            get_waitlist: VecDeque::new(),
            generation: 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == SuperGroupState::Ready
    }

    pub fn process_count(&self) -> usize {
        self.groups.iter().map(|g| g.process_count()).sum()
    }

    pub fn capacity_used(&self) -> usize {
        self.groups.iter().map(|g| g.capacity_used()).sum()
    }

    pub fn default_group(&self) -> Option<&Group> {
        self.groups.get(self.default_group)
    }

    /// Route a get to the default Group, or queue it while the SuperGroup
    /// is not READY yet. Returns whether a session was checked out
    /// synchronously.
    pub fn get(
        &mut self,
        options: &Options,
        callback: GetCallback,
        ctx: &SchedulingContext<'_>,
        actions: &mut Actions,
    ) -> bool {
        match self.state {
            SuperGroupState::Ready => {
                let index = self.default_group;
                self.groups
                    .get_mut(index)
                    .expect("a READY SuperGroup has a default group")
                    .get(options, callback, ctx, actions)
            }
            SuperGroupState::Initializing | SuperGroupState::Restarting => {
                debug!(super_group = %self.name, state = self.state.as_str(),
                       "Queueing request on SuperGroup waitlist");
                self.get_waitlist.push_back(GetWaiter {
                    options: options.clone(),
                    callback,
                });
                false
            }
            SuperGroupState::Destroying | SuperGroupState::Destroyed => {
                unreachable!("get() on a destroyed SuperGroup")
            }
        }
    }

    /// Finish initialization: install the component Groups and hand the
    /// queued callers to them. Called under the Pool lock by the
    /// initializer task.
    pub fn finish_initialization(
        &mut self,
        components: Vec<ComponentInfo>,
        groups: Vec<Group>,
        ctx: &SchedulingContext<'_>,
        actions: &mut Actions,
    ) {
        assert_eq!(self.state, SuperGroupState::Initializing);
        assert!(!groups.is_empty());
        assert_eq!(components.len(), groups.len());
        self.default_group = components
            .iter()
            .position(|c| c.is_default)
            .unwrap_or(0);
        self.components = components;
        self.groups = groups;
        self.state = SuperGroupState::Ready;
        self.assign_get_waitlist_to_groups(ctx, actions);
    }

    /// Drain the SuperGroup waitlist into the (now READY) groups
    pub fn assign_get_waitlist_to_groups(
        &mut self,
        ctx: &SchedulingContext<'_>,
        actions: &mut Actions,
    ) {
        let index = self.default_group;
        while let Some(waiter) = self.get_waitlist.pop_front() {
            let group = self
                .groups
                .get_mut(index)
                .expect("a READY SuperGroup has a default group");
            group.get(&waiter.options, waiter.callback, ctx, actions);
        }
    }

    /// Restart every component with fresh options. The SuperGroup passes
    /// through RESTARTING; component discovery is cheap, so it completes
    /// within the same lock-held call.
    pub fn restart(&mut self, options: Options, ctx: &SchedulingContext<'_>, actions: &mut Actions) {
        assert!(self.is_ready());
        self.state = SuperGroupState::Restarting;
        self.generation += 1;
        self.options = options.clone();
        for group in &mut self.groups {
            if !group.restarting && group.is_alive() {
                group.restart(options.clone(), ctx.pool, &self.name);
            }
        }
        self.state = SuperGroupState::Ready;
        self.assign_get_waitlist_to_groups(ctx, actions);
    }

    /// Tear the SuperGroup down: abort queued callers, shut every group
    /// down, and hand the group bodies to the caller so drain completion
    /// can be awaited outside the pool map.
    pub fn destroy(
        &mut self,
        pool: &Arc<Pool>,
        actions: &mut Actions,
    ) -> Vec<(Group, oneshot::Receiver<()>)> {
        self.state = SuperGroupState::Destroying;
        for waiter in self.get_waitlist.drain(..) {
            let callback = waiter.callback;
            actions.push(move || {
                callback(Err(crate::error::PoolError::GetAborted(
                    "The containing SuperGroup was detached".to_string(),
                )))
            });
        }
        let mut result = Vec::new();
        for mut group in self.groups.drain(..) {
            let receiver = if group.is_alive() {
                group.begin_shutdown(pool, actions)
            } else {
                let (tx, rx) = oneshot::channel();
                if group.life == GroupLifeStatus::ShutDown {
                    let _ = tx.send(());
                }
                rx
            };
            result.push((group, receiver));
        }
        self.state = SuperGroupState::Destroyed;
        result
    }

    pub(crate) fn inspect_xml(&self, out: &mut String, now_us: u64, include_secrets: bool) {
        use crate::util::escape_for_xml;
        use std::fmt::Write as _;
        let _ = write!(out, "<name>{}</name>", escape_for_xml(&self.name));
        let _ = write!(out, "<state>{}</state>", self.state.as_str());
        let _ = write!(
            out,
            "<get_wait_list_size>{}</get_wait_list_size>",
            self.get_waitlist.len()
        );
        let _ = write!(out, "<utilization>{}</utilization>", self.capacity_used());
        if include_secrets {
            let _ = write!(out, "<secret>{}</secret>", escape_for_xml(&self.secret));
        }
        for (index, group) in self.groups.iter().enumerate() {
            let is_default = self
                .components
                .get(index)
                .map(|c| c.is_default)
                .unwrap_or(index == self.default_group);
            if is_default {
                out.push_str("<group default=\"true\">");
            } else {
                out.push_str("<group>");
            }
            group.inspect_xml(out, now_us, include_secrets);
            out.push_str("</group>");
        }
    }
}
