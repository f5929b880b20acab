//! One tracked service: its lookups, actions and the version state machine
//! that decides when a queried version becomes latest, deployed or approved.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use tokio::task::JoinHandle;

use crate::command::run_command;
use crate::error::{ArgusError, Result};
use crate::lookup::{self, VersionLookup};
use crate::notify::{HttpNotifier, Notifier, NotifyConfig, VersionEvent};
use crate::service::{ResolvedOptions, ServiceConfig, ServiceDefaults};
use crate::sinks::{DatabaseMessage, ServiceSinks};
use crate::status::{Fails, VersionSnapshot, VersionState, SKIP_PREFIX};
use crate::types::{now_timestamp, parse_semantic, TemplateVars};
use crate::webhook::{WebHook, WebHookConfig};

pub struct Lookups {
    pub latest: Arc<dyn VersionLookup>,
    pub deployed: Option<Arc<dyn VersionLookup>>,
}

#[derive(Default)]
pub struct Actions {
    pub notifiers: Vec<Arc<dyn Notifier>>,
    pub webhooks: Vec<Arc<WebHook>>,
    pub commands: Vec<Vec<String>>,
}

pub struct TrackedService {
    id: String,
    config: ServiceConfig,
    options: ResolvedOptions,
    state: Arc<VersionState>,
    sinks: ServiceSinks,
    lookups: Lookups,
    actions: Actions,
    /// Auto-approved action runs still in flight.
    action_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TrackedService {
    pub fn new(
        id: &str,
        config: ServiceConfig,
        options: ResolvedOptions,
        state: Arc<VersionState>,
        sinks: ServiceSinks,
        lookups: Lookups,
        actions: Actions,
    ) -> Self {
        let webhook_ids: Vec<String> = actions.webhooks.iter().map(|w| w.id().to_string()).collect();
        state.init_fails(Fails::new(
            config.notify.keys(),
            &webhook_ids,
            actions.commands.len(),
        ));
        Self {
            id: id.to_string(),
            config,
            options,
            state,
            sinks,
            lookups,
            actions,
            action_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build lookups, notifiers and webhooks from config, merging service
    /// entries with their global counterparts.
    pub fn from_config(
        id: &str,
        config: ServiceConfig,
        defaults: &ServiceDefaults,
        global_notify: &BTreeMap<String, NotifyConfig>,
        global_webhook: &BTreeMap<String, WebHookConfig>,
        state: Arc<VersionState>,
        sinks: ServiceSinks,
    ) -> Result<Self> {
        let options = config.resolve_options(defaults)?;
        let semantic = options.semantic_versioning;
        let lookups = Lookups {
            latest: lookup::latest_lookup(id, &config.latest_version, semantic)?,
            deployed: config
                .deployed_version
                .as_ref()
                .map(|spec| lookup::deployed_lookup(id, spec, semantic))
                .transpose()?,
        };

        let mut actions = Actions {
            commands: config.command.clone(),
            ..Default::default()
        };
        for (notify_id, cfg) in &config.notify {
            let merged = cfg.merged(global_notify.get(notify_id));
            actions
                .notifiers
                .push(Arc::new(HttpNotifier::new(notify_id, merged)?));
        }
        for (webhook_id, cfg) in &config.webhook {
            let merged = cfg.merged(global_webhook.get(webhook_id));
            actions
                .webhooks
                .push(Arc::new(WebHook::new(webhook_id, merged)?));
        }

        Ok(Self::new(id, config, options, state, sinks, lookups, actions))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn options(&self) -> &ResolvedOptions {
        &self.options
    }

    pub fn state(&self) -> &Arc<VersionState> {
        &self.state
    }

    pub fn sinks(&self) -> &ServiceSinks {
        &self.sinks
    }

    pub fn lookups(&self) -> &Lookups {
        &self.lookups
    }

    fn has_actions(&self) -> bool {
        !self.actions.webhooks.is_empty() || !self.actions.commands.is_empty()
    }

    pub fn template_vars(&self, old_version: &str) -> TemplateVars {
        let mut vars = TemplateVars {
            service_id: self.id.clone(),
            service_name: self.config.display_name(&self.id).to_string(),
            service_url: self.lookups.latest.service_url(),
            web_url: String::new(),
            version: self.state.latest_version(),
            old_version: old_version.to_string(),
        };
        if let Some(web_url) = &self.config.dashboard.web_url {
            vars.web_url = vars.render(web_url);
        }
        vars
    }

    /// Emit a database message for whatever changed since `before`, plus a
    /// save signal.
    fn persist_changes(&self, before: &VersionSnapshot) {
        let cells = self.state.snapshot().changed_cells(before);
        if cells.is_empty() {
            return;
        }
        self.sinks
            .send_db(DatabaseMessage::update(&self.id, cells));
        self.sinks.signal_save();
    }

    // ─── State transitions ────────────────────────────────────────────────

    /// Apply a queried latest version. Returns true when this is a new
    /// release that should be announced.
    ///
    /// In semantic mode a version lower than the current latest is rejected
    /// with [`ArgusError::VersionRegression`] and state is left untouched.
    pub fn handle_latest(&self, queried: &str) -> Result<bool> {
        let before = self.state.snapshot();
        let current = &before.latest_version;
        if queried == current {
            return Ok(false);
        }
        if self.options.semantic_versioning && !current.is_empty() {
            let new = parse_semantic(queried)?;
            if let Ok(old) = parse_semantic(current) {
                if new < old {
                    return Err(ArgusError::VersionRegression {
                        queried: queried.to_string(),
                        latest: current.clone(),
                    });
                }
            }
        }

        let ts = now_timestamp();
        self.state.set_latest_version(queried, &ts);

        if current.is_empty() {
            if before.deployed_version.is_empty() {
                self.state.set_deployed_version(queried, &ts);
            }
            tracing::info!(service = %self.id, version = %queried, "Latest Release");
            self.persist_changes(&before);
            return Ok(false);
        }

        tracing::info!(service = %self.id, version = %queried, old_version = %current, "New Release");
        self.persist_changes(&before);
        Ok(true)
    }

    /// Apply a queried deployed version. Returns true when it changed.
    pub fn handle_deployed(&self, queried: &str) -> Result<bool> {
        let before = self.state.snapshot();
        if queried == before.deployed_version {
            return Ok(false);
        }
        let ts = now_timestamp();

        let lift_latest = before.latest_version.is_empty()
            || (self.options.semantic_versioning
                && match (
                    parse_semantic(queried),
                    parse_semantic(&before.latest_version),
                ) {
                    (Ok(deployed), Ok(latest)) => deployed > latest,
                    _ => false,
                });
        if lift_latest {
            self.state.set_latest_version(queried, &ts);
        }
        self.state.set_deployed_version(queried, &ts);

        tracing::info!(service = %self.id, version = %queried, "Updated to");
        self.persist_changes(&before);
        Ok(true)
    }

    /// Once every webhook and command for the latest version has succeeded,
    /// record the release as deployed (or approved, when a deployed lookup
    /// owns the deployed version).
    pub fn updated_version(&self) {
        let before = self.state.snapshot();
        if before.deployed_version == before.latest_version {
            return;
        }
        if !self.state.fails().actions_passed() {
            return;
        }
        if self.lookups.deployed.is_some() {
            if self.has_actions() {
                self.state.set_approved_version(&before.latest_version);
                self.persist_changes(&before);
            }
            return;
        }
        self.state
            .set_deployed_version(&before.latest_version, &now_timestamp());
        self.persist_changes(&before);
    }

    /// Mark `version` (which must be the current latest) as skipped.
    pub fn skip(&self, version: &str) -> Result<()> {
        let before = self.state.snapshot();
        if version != before.latest_version {
            return Err(ArgusError::Action(format!(
                "cannot skip {version:?}: latest is {:?}",
                before.latest_version
            )));
        }
        self.state
            .set_approved_version(&format!("{SKIP_PREFIX}{version}"));
        tracing::info!(service = %self.id, version = %version, "release skipped");
        self.persist_changes(&before);
        Ok(())
    }

    /// Approve `version` (which must be the current latest) and run the
    /// webhooks and commands that have not yet succeeded for it.
    pub async fn approve(&self, version: &str) -> Result<()> {
        let before = self.state.snapshot();
        if version != before.latest_version {
            return Err(ArgusError::Action(format!(
                "cannot approve {version:?}: latest is {:?}",
                before.latest_version
            )));
        }
        self.state.set_approved_version(version);
        self.persist_changes(&before);
        self.dispatch_actions(false).await;
        Ok(())
    }

    // ─── Actions ──────────────────────────────────────────────────────────

    pub async fn notify(&self, event: &VersionEvent) {
        let sends = self.actions.notifiers.iter().map(|n| async move {
            let result = n.send(event).await;
            if let Err(e) = &result {
                tracing::error!(service = %self.id, notify = %n.id(), error = %e, "notification failed");
            }
            self.state.set_notify_fail(n.id(), result.is_err());
        });
        join_all(sends).await;
    }

    /// React to a new release: notify, then either run actions
    /// (auto-approve), wait for approval, or mark it deployed straight away.
    ///
    /// Auto-approved actions run on a spawned task; see [`Self::wait_for_actions`].
    pub async fn handle_update_actions(self: &Arc<Self>, old_version: &str) {
        let vars = self.template_vars(old_version);
        self.notify(&VersionEvent::new_release(vars)).await;

        if !self.has_actions() {
            self.updated_version();
            return;
        }
        if !self.options.auto_approve {
            tracing::info!(service = %self.id, "Waiting for approval");
            return;
        }

        let before = self.state.snapshot();
        self.state.set_approved_version(&before.latest_version);
        self.persist_changes(&before);
        tracing::info!(service = %self.id, version = %before.latest_version, "Sending WebHooks/Running Commands");

        let service = Arc::clone(self);
        let task = tokio::spawn(async move {
            service.dispatch_actions(true).await;
        });
        let mut tasks = self.action_tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Wait for every spawned action run to finish.
    pub async fn wait_for_actions(&self) {
        let tasks = std::mem::take(
            &mut *self.action_tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for result in join_all(tasks).await {
            if let Err(e) = result {
                tracing::error!(service = %self.id, error = %e, "action task failed");
            }
        }
    }

    /// Run webhooks and commands for the current latest version. When all of
    /// them have already succeeded they are all re-run; otherwise only the
    /// ones that have not succeeded are.
    pub async fn dispatch_actions(&self, use_delay: bool) {
        let vars = self.template_vars("");
        let fails = self.state.fails();
        let rerun_all = fails.actions_passed();
        let pending = |v: Option<&Option<bool>>| rerun_all || v != Some(&Some(false));

        let hooks = self
            .actions
            .webhooks
            .iter()
            .filter(|w| pending(fails.webhook.get(w.id())))
            .map(|w| self.run_webhook(w, &vars, use_delay));
        let commands = self
            .actions
            .commands
            .iter()
            .enumerate()
            .filter(|(i, _)| pending(fails.command.get(*i)))
            .map(|(i, argv)| self.run_command_at(i, argv, &vars));

        futures::join!(join_all(hooks), join_all(commands));
        self.updated_version();
    }

    async fn run_webhook(&self, hook: &WebHook, vars: &TemplateVars, use_delay: bool) {
        let token = self.sinks.token();
        let delay = hook.delay();
        if use_delay && !delay.is_zero() {
            tracing::info!(service = %self.id, webhook = %hook.id(), delay = ?delay, "delaying webhook");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => return,
            }
        }
        match hook.send(vars, token).await {
            Ok(()) => self.state.set_webhook_fail(hook.id(), false),
            Err(e) => {
                self.state.set_webhook_fail(hook.id(), true);
                tracing::error!(service = %self.id, webhook = %hook.id(), error = %e, "webhook failed");
                if !hook.silent_fails() && !token.is_cancelled() {
                    self.notify(&VersionEvent::action_failed(vars.clone(), e.to_string()))
                        .await;
                }
            }
        }
    }

    async fn run_command_at(&self, index: usize, argv: &[String], vars: &TemplateVars) {
        match run_command(argv, vars).await {
            Ok(()) => self.state.set_command_fail(index, false),
            Err(e) => {
                self.state.set_command_fail(index, true);
                tracing::error!(service = %self.id, error = %e, "command failed");
                self.notify(&VersionEvent::action_failed(vars.clone(), e.to_string()))
                    .await;
            }
        }
    }
}
