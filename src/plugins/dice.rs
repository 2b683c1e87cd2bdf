//! Dice rolling

use rand::Rng;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::application::errors::BotError;
use crate::domain::entities::{CommandSpec, GroupSetting, HandlerResult};
use crate::domain::traits::GroupInfo;
use crate::runtime::protocol::{BotCall, EventKind, PluginEvent};
use crate::runtime::{BotLink, EventContext, Invocation, JobContext};

use super::descriptor::PluginDescriptor;

pub const NAME: &str = "dice";

const MAX_SIDES: u32 = 1000;

pub fn descriptor() -> Result<PluginDescriptor, BotError> {
    PluginDescriptor::builder(NAME)
        .description("Roll dice")
        .default_option("sides", json!(6))
        .default_option("style", json!(["plain", "fancy"]))
        .default_option("hourly", json!(false))
        .command(
            CommandSpec::new("roll [sides]")
                .with_description("Roll a die; 'roll a d20' works too")
                .with_sugar(r"^roll (a )?d(?P<sides>\d+)$")
                .with_handler(roll),
        )
        .job("hourly", Duration::from_secs(3600), hourly)
        .on_event(EventKind::GroupIncrease, welcome)
        .build()
}

async fn roll(inv: Invocation) -> HandlerResult {
    let sides = match inv.args.get("sides") {
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| BotError::validation(format!("'{}' is not a number of sides", raw)))?,
        None => configured_sides(inv.option_value("sides").as_ref())?,
    };
    check_sides(sides)?;

    let fancy = inv.option_value("style").as_ref().and_then(selected) == Some("fancy");
    Ok(Some(render(roll_die(sides), sides, fancy)))
}

fn check_sides(sides: u32) -> Result<u32, BotError> {
    if (2..=MAX_SIDES).contains(&sides) {
        Ok(sides)
    } else {
        Err(BotError::validation(format!("a die needs 2 to {} sides", MAX_SIDES)))
    }
}

/// The group's `sides` option, 6 when unset
fn configured_sides(value: Option<&Value>) -> Result<u32, BotError> {
    let Some(value) = value else {
        return Ok(6);
    };
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| BotError::validation(format!("a die needs 2 to {} sides, configured {}", MAX_SIDES, value)))
        .and_then(check_sides)
}

fn roll_die(sides: u32) -> u32 {
    rand::rng().random_range(1..=sides)
}

fn render(value: u32, sides: u32, fancy: bool) -> String {
    if fancy {
        format!("🎲 d{} → {}", sides, value)
    } else {
        format!("Rolled {} (d{})", value, sides)
    }
}

/// Current selection of an enum option
fn selected(value: &Value) -> Option<&str> {
    value.as_array()?.first()?.as_str()
}

async fn group_setting(bot: &BotLink, group_id: &str) -> Result<GroupSetting, BotError> {
    let raw = bot
        .request(BotCall::GroupSetting {
            group_id: group_id.to_string(),
        })
        .await?;
    serde_json::from_value(raw).map_err(|e| BotError::Internal(e.to_string()))
}

/// Rolls into every group that applied the plugin and turned `hourly` on
async fn hourly(ctx: JobContext) -> Result<(), BotError> {
    for bot in &ctx.bots {
        let groups: Vec<GroupInfo> = serde_json::from_value(bot.request(BotCall::GroupList).await?)
            .map_err(|e| BotError::Internal(e.to_string()))?;

        for group in groups {
            let setting = group_setting(bot, &group.group_id).await?;
            let Some(option) = setting.plugin.get(NAME) else {
                continue;
            };
            if !option.apply || option.get("hourly") != Some(Value::Bool(true)) {
                continue;
            }

            let sides = match configured_sides(option.get("sides").as_ref()) {
                Ok(sides) => sides,
                Err(e) => {
                    warn!(account = %bot.account(), group = %group.group_id, error = %e, "hourly roll skipped");
                    continue;
                }
            };
            let text = format!("Hourly roll: {}", render(roll_die(sides), sides, false));
            bot.send_group_message(&group.group_id, &text).await?;
            debug!(account = %bot.account(), group = %group.group_id, "hourly roll sent");
        }
    }
    Ok(())
}

async fn welcome(ctx: EventContext) -> Result<(), BotError> {
    let PluginEvent::GroupIncrease(notice) = &ctx.event else {
        return Ok(());
    };
    if notice.user_id == ctx.bot.account() {
        return Ok(());
    }
    let setting = group_setting(&ctx.bot, &notice.group_id).await?;
    if setting.is_applied(NAME) {
        ctx.bot
            .send_group_message(&notice.group_id, "Welcome! Try 'roll a d20'.")
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roll_stays_in_range() {
        for _ in 0..200 {
            let n = roll_die(6);
            assert!((1..=6).contains(&n));
        }
    }

    #[test]
    fn test_configured_sides_rejects_values_past_u32() {
        assert_eq!(configured_sides(None).unwrap(), 6);
        assert_eq!(configured_sides(Some(&json!(20))).unwrap(), 20);

        // 2^32 + 6 would wrap to a six-sided die
        let err = configured_sides(Some(&json!(4_294_967_302u64))).unwrap_err();
        assert!(matches!(err, BotError::Validation(_)));
        assert!(configured_sides(Some(&json!(1))).is_err());
        assert!(configured_sides(Some(&json!(-3))).is_err());
        assert!(configured_sides(Some(&json!(MAX_SIDES + 1))).is_err());
    }

    #[test]
    fn test_selected_is_first_member() {
        assert_eq!(selected(&json!(["fancy", "plain"])), Some("fancy"));
        assert_eq!(selected(&json!("plain")), None);
    }

    #[test]
    fn test_descriptor_defaults() {
        let dice = descriptor().unwrap();
        assert_eq!(dice.defaults()["sides"], json!(6));
        assert_eq!(dice.jobs().len(), 1);
        assert_eq!(dice.handlers(EventKind::GroupIncrease).len(), 1);
        assert!(!dice.is_core());
    }
}
