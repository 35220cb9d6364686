//! 备份相关领域模型

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::error::DeployError;

/// 恢复操作的确认令牌
///
/// 恢复会删除当前数据，调用方必须显式传入此值
pub const RESTORE_CONFIRMATION_TOKEN: &str = "yes-destroy-current-state";

/// 备份归档扩展名
pub const ARCHIVE_EXTENSION: &str = ".tar.gz";

/// 部署前安全备份的名称前缀
pub const SAFETY_PREFIX: &str = "pre-change_";

/// 默认（定时）备份的名称前缀
pub const SCHEDULED_PREFIX: &str = "backup_";

/// 保留类别（由名称前缀推导）
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetentionClass {
    /// 变更前的安全备份
    Safety,
    /// 默认时间戳命名的备份（定时任务产生）
    Scheduled,
    /// 人工命名的备份
    Manual,
}

impl RetentionClass {
    pub fn from_name(name: &str) -> Self {
        if name.starts_with(SAFETY_PREFIX) {
            RetentionClass::Safety
        } else if name.starts_with(SCHEDULED_PREFIX) {
            RetentionClass::Scheduled
        } else {
            RetentionClass::Manual
        }
    }
}

/// 备份记录，创建后不可变
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct BackupRecord {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub source_target: String,
    pub retention_class: RetentionClass,
}

impl BackupRecord {
    pub fn new(name: impl Into<String>, created_at: DateTime<Utc>, size_bytes: u64, source_target: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            retention_class: RetentionClass::from_name(&name),
            name,
            created_at,
            size_bytes,
            source_target: source_target.into(),
        }
    }

    /// 归档文件名
    pub fn archive_file(&self) -> String {
        archive_file(&self.name)
    }

    /// 是否早于保留期限
    ///
    /// 期限超出可表示的日期范围时视为未过期
    pub fn is_expired(&self, now: DateTime<Utc>, retention_days: u32) -> bool {
        now.checked_sub_signed(chrono::Duration::days(i64::from(retention_days)))
            .map_or(false, |cutoff| self.created_at < cutoff)
    }
}

pub fn archive_file(name: &str) -> String {
    format!("{}{}", name, ARCHIVE_EXTENSION)
}

/// 默认备份名 `backup_YYYYMMDD_HHMMSS`
pub fn default_backup_name(now: DateTime<Utc>) -> String {
    format!("{}{}", SCHEDULED_PREFIX, now.format("%Y%m%d_%H%M%S"))
}

/// 校验备份名，名称会拼入远程命令，只允许安全字符
pub fn validate_backup_name(name: &str) -> Result<(), DeployError> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && !name.starts_with(['.', '-'])
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(DeployError::invalid_input(format!("invalid backup name '{}'", name)))
    }
}

/// 校验恢复确认令牌
pub fn check_confirmation(token: Option<&str>) -> Result<(), DeployError> {
    match token {
        Some(t) if t == RESTORE_CONFIRMATION_TOKEN => Ok(()),
        Some(_) => Err(DeployError::ConfirmationDeclined(
            "confirmation token does not match".to_string(),
        )),
        None => Err(DeployError::ConfirmationDeclined(
            "restore requires an explicit confirmation token".to_string(),
        )),
    }
}

/// 解析归档列表
///
/// 每行格式 `<mtime epoch>[.<frac>] <size bytes> <file name>`，
/// 非 `.tar.gz` 文件和格式错误的行会被跳过。结果按时间倒序
pub fn parse_archive_listing(output: &str, source_target: &str) -> Vec<BackupRecord> {
    let mut records: Vec<BackupRecord> = output
        .lines()
        .filter_map(|line| {
            let mut parts = line.trim().splitn(3, ' ');
            let mtime = parts.next()?;
            let size = parts.next()?.parse::<u64>().ok()?;
            let file = parts.next()?;
            let name = file.strip_suffix(ARCHIVE_EXTENSION)?;
            let secs = mtime.split('.').next()?.parse::<i64>().ok()?;
            let created_at = Utc.timestamp_opt(secs, 0).single()?;
            Some(BackupRecord::new(name, created_at, size, source_target))
        })
        .collect();

    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    records
}

/// 定时备份条目
///
/// 只描述周期与命令，由外部调度器（cron 等）注册
#[derive(Clone, Debug, Serialize)]
pub struct ScheduleEntry {
    pub target: String,
    pub period: String,
    pub command: String,
}

impl ScheduleEntry {
    /// crontab 行
    pub fn crontab_line(&self) -> String {
        format!("{} {}", self.period, self.command)
    }
}

/// 校验 cron 风格的周期描述
///
/// 支持五段式表达式和 `@hourly` / `@daily` / `@weekly` / `@monthly`
pub fn validate_cron_spec(spec: &str) -> Result<String, DeployError> {
    let spec = spec.trim();
    if matches!(spec, "@hourly" | "@daily" | "@weekly" | "@monthly") {
        return Ok(spec.to_string());
    }

    let fields: Vec<&str> = spec.split_whitespace().collect();
    let valid = fields.len() == 5
        && fields.iter().all(|f| {
            f.chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '*' | '/' | ',' | '-'))
        });
    if valid {
        Ok(fields.join(" "))
    } else {
        Err(DeployError::invalid_input(format!("invalid schedule '{}'", spec)))
    }
}
