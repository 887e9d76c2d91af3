use std::collections::HashSet;

use async_trait::async_trait;
use bidscout_core::{
    CategoryRuleRecord, DetailField, DetailSettingsRecord, ListSettingsRecord, NoticeStatus,
    PersistedNotice,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

use crate::store::{sequence_unstored, NoticeDetailRecord, NoticeStore, RunLog, StoreError};

/// PostgreSQL store. Schema lives in the workspace `migrations/` directory.
#[derive(Debug, Clone)]
pub struct PgNoticeStore {
    pool: PgPool,
}

const LIST_COLUMNS: &str = "org_name, url, iframe, row_xpath, paging, start_page, end_page, \
     title, detail_url, posted_date, posted_by, exception_row, org_region, registration, active";

const DETAIL_COLUMNS: &str = "org_name, title, body_html, file_name, file_url, notice_div, \
     notice_num, org_dept, org_man, org_tel, active";

fn page_number(row: &PgRow, column: &str) -> Result<Option<u32>, sqlx::Error> {
    let value: Option<i32> = row.try_get(column)?;
    Ok(value.map(|v| v.max(0) as u32))
}

fn list_record(row: &PgRow) -> Result<ListSettingsRecord, sqlx::Error> {
    Ok(ListSettingsRecord {
        org_name: row.try_get("org_name")?,
        url: row.try_get("url")?,
        iframe: row.try_get("iframe")?,
        row_xpath: row.try_get("row_xpath")?,
        paging: row.try_get("paging")?,
        start_page: page_number(row, "start_page")?,
        end_page: page_number(row, "end_page")?,
        title: row.try_get("title")?,
        detail_url: row.try_get("detail_url")?,
        posted_date: row.try_get("posted_date")?,
        posted_by: row.try_get("posted_by")?,
        exception_row: row.try_get("exception_row")?,
        org_region: row.try_get("org_region")?,
        registration: row.try_get("registration")?,
        active: row.try_get("active")?,
    })
}

fn detail_record(row: &PgRow) -> Result<DetailSettingsRecord, sqlx::Error> {
    Ok(DetailSettingsRecord {
        org_name: row.try_get("org_name")?,
        title: row.try_get("title")?,
        body_html: row.try_get("body_html")?,
        file_name: row.try_get("file_name")?,
        file_url: row.try_get("file_url")?,
        notice_div: row.try_get("notice_div")?,
        notice_num: row.try_get("notice_num")?,
        org_dept: row.try_get("org_dept")?,
        org_man: row.try_get("org_man")?,
        org_tel: row.try_get("org_tel")?,
        active: row.try_get("active")?,
    })
}

fn notice_from_row(row: &PgRow) -> Result<PersistedNotice, sqlx::Error> {
    let status: i16 = row.try_get("is_selected")?;
    Ok(PersistedNotice {
        id: Some(row.try_get("id")?),
        org_name: row.try_get("org_name")?,
        title: row.try_get("title")?,
        detail_url: row.try_get("detail_url")?,
        posted_date: row.try_get("posted_date")?,
        posted_by: row.try_get("posted_by")?,
        category: row.try_get("category")?,
        sequence: row.try_get("sequence")?,
        status: NoticeStatus::from_code(status),
        scraped_at: row.try_get("scraped_at")?,
    })
}

impl PgNoticeStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl NoticeStore for PgNoticeStore {
    async fn list_configs(&self) -> Result<Vec<ListSettingsRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LIST_COLUMNS} FROM settings_notice_list ORDER BY org_name"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(list_record).collect::<Result<_, _>>()?)
    }

    async fn list_config(&self, org_name: &str) -> Result<Option<ListSettingsRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {LIST_COLUMNS} FROM settings_notice_list WHERE org_name = $1"
        ))
        .bind(org_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(list_record).transpose()?)
    }

    async fn detail_config(
        &self,
        org_name: &str,
    ) -> Result<Option<DetailSettingsRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DETAIL_COLUMNS} FROM settings_notice_detail WHERE org_name = $1"
        ))
        .bind(org_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(detail_record).transpose()?)
    }

    async fn active_rules(&self) -> Result<Vec<CategoryRuleRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT priority, category, keywords, nots, min_point, active
              FROM settings_notice_category
             WHERE active
             ORDER BY priority DESC, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(CategoryRuleRecord {
                priority: row.try_get("priority")?,
                category: row.try_get("category")?,
                keywords: row.try_get("keywords")?,
                nots: row.try_get("nots")?,
                min_point: row.try_get("min_point")?,
                active: row.try_get("active")?,
            });
        }
        Ok(out)
    }

    async fn recent_urls(
        &self,
        org_name: &str,
        limit: usize,
    ) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            (SELECT detail_url FROM notices
              WHERE org_name = $1 ORDER BY id DESC LIMIT $2)
            UNION
            (SELECT detail_url FROM notices_uncategorized
              WHERE org_name = $1 ORDER BY id DESC LIMIT $2)
            "#,
        )
        .bind(org_name)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("detail_url"))
            .collect::<Result<_, _>>()
            .map_err(StoreError::from)
    }

    async fn max_sequence(&self, org_name: &str) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(sequence), 0)::BIGINT AS max_seq FROM notices WHERE org_name = $1",
        )
        .bind(org_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("max_seq")?)
    }

    /// Runs under a transaction-scoped advisory lock on the organization.
    /// Rows another process stored since the batch was numbered are dropped
    /// and the rest are renumbered after the current maximum.
    async fn insert_notices(
        &self,
        org_name: &str,
        notices: &[PersistedNotice],
    ) -> Result<usize, StoreError> {
        if notices.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(org_name)
            .execute(&mut *tx)
            .await?;

        let current: i64 = sqlx::query(
            "SELECT COALESCE(MAX(sequence), 0)::BIGINT AS max_seq FROM notices WHERE org_name = $1",
        )
        .bind(org_name)
        .fetch_one(&mut *tx)
        .await?
        .try_get("max_seq")?;

        let urls: Vec<String> = notices.iter().map(|n| n.detail_url.clone()).collect();
        let stored: HashSet<String> = sqlx::query(
            "SELECT detail_url FROM notices WHERE org_name = $1 AND detail_url = ANY($2)",
        )
        .bind(org_name)
        .bind(&urls)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| row.try_get::<String, _>("detail_url"))
        .collect::<Result<_, _>>()?;

        let batch = sequence_unstored(notices, &stored, current);
        if batch.len() < notices.len() {
            debug!(
                org_name,
                skipped = notices.len() - batch.len(),
                "rows stored concurrently, renumbering batch"
            );
        }

        let mut inserted = 0usize;
        for notice in &batch {
            let result = sqlx::query(
                r#"
                INSERT INTO notices
                    (org_name, title, detail_url, posted_date, posted_by, category,
                     sequence, is_selected, scraped_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (org_name, detail_url) DO NOTHING
                "#,
            )
            .bind(&notice.org_name)
            .bind(&notice.title)
            .bind(&notice.detail_url)
            .bind(notice.posted_date)
            .bind(&notice.posted_by)
            .bind(&notice.category)
            .bind(notice.sequence)
            .bind(notice.status.code())
            .bind(notice.scraped_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn archive_uncategorized(
        &self,
        notices: &[PersistedNotice],
    ) -> Result<usize, StoreError> {
        let mut archived = 0usize;
        for notice in notices {
            let result = sqlx::query(
                r#"
                INSERT INTO notices_uncategorized
                    (org_name, title, detail_url, posted_date, posted_by, is_selected, scraped_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (org_name, detail_url) DO NOTHING
                "#,
            )
            .bind(&notice.org_name)
            .bind(&notice.title)
            .bind(&notice.detail_url)
            .bind(notice.posted_date)
            .bind(&notice.posted_by)
            .bind(notice.status.code())
            .bind(notice.scraped_at)
            .execute(&self.pool)
            .await?;
            archived += result.rows_affected() as usize;
        }
        Ok(archived)
    }

    async fn notice(&self, id: i64) -> Result<Option<PersistedNotice>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, org_name, title, detail_url, posted_date, posted_by, category,
                   sequence, is_selected, scraped_at
              FROM notices
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(notice_from_row).transpose()?)
    }

    async fn upsert_detail(&self, detail: &NoticeDetailRecord) -> Result<(), StoreError> {
        let field = |f: DetailField| detail.fields.get(f.as_str()).cloned();
        sqlx::query(
            r#"
            INSERT INTO notice_details
                (notice_id, org_name, detail_url, title, body_html, file_name, file_url,
                 notice_div, notice_num, org_dept, org_man, org_tel, scraped_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (notice_id) DO UPDATE SET
                title = EXCLUDED.title,
                body_html = EXCLUDED.body_html,
                file_name = EXCLUDED.file_name,
                file_url = EXCLUDED.file_url,
                notice_div = EXCLUDED.notice_div,
                notice_num = EXCLUDED.notice_num,
                org_dept = EXCLUDED.org_dept,
                org_man = EXCLUDED.org_man,
                org_tel = EXCLUDED.org_tel,
                scraped_at = EXCLUDED.scraped_at
            "#,
        )
        .bind(detail.notice_id)
        .bind(&detail.org_name)
        .bind(&detail.detail_url)
        .bind(field(DetailField::Title))
        .bind(field(DetailField::BodyHtml))
        .bind(field(DetailField::FileName))
        .bind(field(DetailField::FileUrl))
        .bind(field(DetailField::NoticeDiv))
        .bind(field(DetailField::NoticeNum))
        .bind(field(DetailField::OrgDept))
        .bind(field(DetailField::OrgMan))
        .bind(field(DetailField::OrgTel))
        .bind(detail.scraped_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_run_log(&self, log: &RunLog) -> Result<(), StoreError> {
        let status = serde_json::to_value(log.status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        sqlx::query(
            r#"
            INSERT INTO scrape_logs
                (run_id, endpoint, params, total_seen, collected, new_count, inserted,
                 archived, error_count, status, error_text, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(log.run_id)
        .bind(&log.endpoint)
        .bind(&log.params)
        .bind(log.total_seen as i64)
        .bind(log.collected as i64)
        .bind(log.new as i64)
        .bind(log.inserted as i64)
        .bind(log.archived as i64)
        .bind(log.error_count as i64)
        .bind(status)
        .bind(&log.error_text)
        .bind(log.started_at)
        .bind(log.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
