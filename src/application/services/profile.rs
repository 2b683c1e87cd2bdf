//! Per-account settings store
//!
//! Every mutation is a two-phase commit: apply in memory, persist, and put
//! the previous document back if persisting fails. Callers serialize access
//! by holding the profile behind one async mutex per bot unit.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::errors::BotError;
use crate::domain::entities::{GroupSetting, PermissionLevel, PluginOption, SettingDocument};
use crate::domain::traits::{DocumentStore, GroupInfo};
use crate::infrastructure::storage::{disabled_key, settings_key};

/// Settings document of one account plus the plugin defaults it is merged with
pub struct Profile {
    key: String,
    store: Arc<dyn DocumentStore>,
    document: SettingDocument,
    persisted: Option<SettingDocument>,
    defaults: BTreeMap<String, Map<String, Value>>,
}

impl Profile {
    /// Load the account's document, creating an empty one on first start
    pub async fn load(uin: &str, store: Arc<dyn DocumentStore>) -> Result<Self, BotError> {
        let key = settings_key(uin);
        let stored = store.load(&key).await?;

        let mut profile = match stored {
            Some(raw) => {
                let document: SettingDocument = serde_json::from_value(raw)
                    .map_err(|e| BotError::Persistence(format!("corrupt settings for {}: {}", uin, e)))?;
                Self {
                    key,
                    store,
                    persisted: Some(document.clone()),
                    document,
                    defaults: BTreeMap::new(),
                }
            }
            None => Self {
                key,
                store,
                document: SettingDocument::new(),
                persisted: None,
                defaults: BTreeMap::new(),
            },
        };

        if profile.persist().await? {
            info!(account = %uin, "created settings document");
        }
        Ok(profile)
    }

    /// Record a plugin's default options; they are read-only from here on
    pub fn register_plugin(&mut self, plugin: &str, defaults: Map<String, Value>) {
        self.defaults.insert(plugin.to_string(), defaults);
    }

    pub fn has_plugin(&self, plugin: &str) -> bool {
        self.defaults.contains_key(plugin)
    }

    pub fn document(&self) -> &SettingDocument {
        &self.document
    }

    pub fn group(&self, group_id: &str) -> Option<&GroupSetting> {
        self.document.get(group_id)
    }

    /// Cheap copy attached to outgoing message events
    pub fn snapshot(&self, group_id: &str) -> Option<Arc<GroupSetting>> {
        self.document.get(group_id).cloned().map(Arc::new)
    }

    /// Reconcile the document with the account's group list: add listed
    /// groups, drop the ones the account is no longer in, and merge every
    /// registered plugin default.
    ///
    /// Returns whether the document had to be written.
    pub async fn refresh(&mut self, groups: &[GroupInfo]) -> Result<bool, BotError> {
        let defaults = self.defaults.clone();
        let listed: BTreeSet<&str> = groups.iter().map(|g| g.group_id.as_str()).collect();
        let changed = self
            .transact(|doc| {
                doc.retain(|group_id, _| listed.contains(group_id.as_str()));
                for group in groups {
                    let entry = doc
                        .entry(group.group_id.clone())
                        .or_insert_with(|| GroupSetting::new(&group.name));
                    if entry.name.is_empty() {
                        entry.name = group.name.clone();
                    }
                }
                for setting in doc.values_mut() {
                    merge_group(setting, &defaults);
                }
                Ok(())
            })
            .await?;
        debug!(key = %self.key, groups = groups.len(), "settings refreshed");
        Ok(changed)
    }

    pub async fn on_group_join(&mut self, group: &GroupInfo) -> Result<(), BotError> {
        let defaults = self.defaults.clone();
        self.transact(|doc| {
            let entry = doc
                .entry(group.group_id.clone())
                .or_insert_with(|| GroupSetting::new(&group.name));
            merge_group(entry, &defaults);
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Drop a group's entry; returns whether it existed
    pub async fn on_group_leave(&mut self, group_id: &str) -> Result<bool, BotError> {
        let mut existed = false;
        self.transact(|doc| {
            existed = doc.remove(group_id).is_some();
            Ok(())
        })
        .await?;
        Ok(existed)
    }

    /// Type-checked update of one option key
    pub async fn mutate_setting(
        &mut self,
        group_id: &str,
        plugin: &str,
        key: &str,
        value: Value,
    ) -> Result<(), BotError> {
        self.transact(|doc| {
            option_mut(doc, group_id, plugin)?.set_checked(key, value)
        })
        .await?;
        info!(group = %group_id, plugin = %plugin, key = %key, "setting updated");
        Ok(())
    }

    /// Set the apply flag; a locked option needs master level
    pub async fn set_apply(
        &mut self,
        group_id: &str,
        plugin: &str,
        apply: bool,
        caller: PermissionLevel,
    ) -> Result<(), BotError> {
        self.ensure_unlocked(group_id, plugin, caller)?;
        self.mutate_setting(group_id, plugin, "apply", Value::Bool(apply)).await
    }

    pub fn ensure_unlocked(&self, group_id: &str, plugin: &str, caller: PermissionLevel) -> Result<(), BotError> {
        let locked = self
            .document
            .get(group_id)
            .map(|g| g.is_locked(plugin))
            .unwrap_or(false);
        if locked && caller < PermissionLevel::MASTER {
            return Err(BotError::validation(format!(
                "settings of {} are locked in this group",
                plugin
            )));
        }
        Ok(())
    }

    async fn transact<F>(&mut self, apply: F) -> Result<bool, BotError>
    where
        F: FnOnce(&mut SettingDocument) -> Result<(), BotError>,
    {
        let before = self.document.clone();
        if let Err(e) = apply(&mut self.document) {
            self.document = before;
            return Err(e);
        }
        match self.persist().await {
            Ok(written) => Ok(written),
            Err(e) => {
                warn!(key = %self.key, error = %e, "rolling back settings change");
                self.document = before;
                Err(e)
            }
        }
    }

    /// Write the document unless it equals the last persisted one
    async fn persist(&mut self) -> Result<bool, BotError> {
        if self.persisted.as_ref() == Some(&self.document) {
            return Ok(false);
        }
        let raw = serde_json::to_value(&self.document)
            .map_err(|e| BotError::Persistence(e.to_string()))?;
        self.store.save(&self.key, &raw).await?;
        self.persisted = Some(self.document.clone());
        Ok(true)
    }
}

fn merge_group(setting: &mut GroupSetting, defaults: &BTreeMap<String, Map<String, Value>>) {
    for (plugin, custom) in defaults {
        setting
            .plugin
            .entry(plugin.clone())
            .or_insert_with(PluginOption::default)
            .merge_defaults(custom);
    }
}

fn option_mut<'a>(
    doc: &'a mut SettingDocument,
    group_id: &str,
    plugin: &str,
) -> Result<&'a mut PluginOption, BotError> {
    doc.get_mut(group_id)
        .ok_or_else(|| BotError::validation(format!("no settings for group {}", group_id)))?
        .plugin
        .get_mut(plugin)
        .ok_or_else(|| BotError::validation(format!("plugin {} has no settings in group {}", plugin, group_id)))
}

/// Plugins switched off for one account
pub struct DisabledPlugins {
    key: String,
    store: Arc<dyn DocumentStore>,
    names: BTreeSet<String>,
}

impl DisabledPlugins {
    pub async fn load(uin: &str, store: Arc<dyn DocumentStore>) -> Result<Self, BotError> {
        let key = disabled_key(uin);
        let names = match store.load(&key).await? {
            Some(raw) => serde_json::from_value(raw)
                .map_err(|e| BotError::Persistence(format!("corrupt disabled list for {}: {}", uin, e)))?,
            None => BTreeSet::new(),
        };
        Ok(Self { key, store, names })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub async fn disable(&mut self, name: &str) -> Result<(), BotError> {
        if !self.names.insert(name.to_string()) {
            return Err(BotError::validation(format!("{} is already disabled", name)));
        }
        if let Err(e) = self.persist().await {
            self.names.remove(name);
            return Err(e);
        }
        Ok(())
    }

    pub async fn enable(&mut self, name: &str) -> Result<(), BotError> {
        if !self.names.remove(name) {
            return Err(BotError::validation(format!("{} is not disabled", name)));
        }
        if let Err(e) = self.persist().await {
            self.names.insert(name.to_string());
            return Err(e);
        }
        Ok(())
    }

    async fn persist(&self) -> Result<(), BotError> {
        let raw = serde_json::to_value(&self.names).map_err(|e| BotError::Persistence(e.to_string()))?;
        self.store.save(&self.key, &raw).await?;
        Ok(())
    }
}
