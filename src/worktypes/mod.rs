use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::shared::models::schema::{work_type_stages, work_types};
use crate::shared::state::AppState;
use crate::shared::utils::blocking;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageCategory {
    PurchaseOrder,
    Production,
    Install,
    External,
    Admin,
}

impl StageCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PurchaseOrder => "purchase_order",
            Self::Production => "production",
            Self::Install => "install",
            Self::External => "external",
            Self::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "purchase_order" => Some(Self::PurchaseOrder),
            "production" => Some(Self::Production),
            "install" => Some(Self::Install),
            "external" => Some(Self::External),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Insertable, AsChangeset)]
#[diesel(table_name = work_types)]
pub struct WorkType {
    pub id: Uuid,
    pub name: String,
    pub color: String,
    pub is_default: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Insertable, AsChangeset)]
#[diesel(table_name = work_type_stages)]
pub struct WorkTypeStage {
    pub id: Uuid,
    pub work_type_id: Uuid,
    pub name: String,
    pub stage_key: String,
    pub order_index: i32,
    pub category: String,
    pub triggers_scheduler: bool,
    pub triggers_purchase_order: bool,
    pub created_at: DateTime<Utc>,
}

/// Machine key derived from the stage name, e.g. "Order PVC Panels" ->
/// "order_pvc_panels".
pub fn slug_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len());
    let mut last_was_sep = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            key.push(c.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            key.push('_');
            last_was_sep = true;
        }
    }
    key.trim_end_matches('_').to_string()
}

/// Rewrites order indices to match the given id order. The list must be a
/// permutation of the work type's current stage ids.
pub fn reorder_indices(
    existing: &[Uuid],
    requested: &[Uuid],
) -> AppResult<Vec<(Uuid, i32)>> {
    let existing_set: HashSet<Uuid> = existing.iter().copied().collect();
    let requested_set: HashSet<Uuid> = requested.iter().copied().collect();
    if existing_set != requested_set || existing.len() != requested.len() {
        return Err(AppError::Validation(
            "stage id list must match the work type's stages exactly".to_string(),
        ));
    }
    Ok(requested
        .iter()
        .enumerate()
        .map(|(idx, id)| (*id, idx as i32))
        .collect())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResponse {
    pub id: Uuid,
    pub work_type_id: Uuid,
    pub name: String,
    pub stage_key: String,
    pub order_index: i32,
    pub category: String,
    pub triggers_scheduler: bool,
    pub triggers_purchase_order: bool,
}

impl From<WorkTypeStage> for StageResponse {
    fn from(s: WorkTypeStage) -> Self {
        StageResponse {
            id: s.id,
            work_type_id: s.work_type_id,
            name: s.name,
            stage_key: s.stage_key,
            order_index: s.order_index,
            category: s.category,
            triggers_scheduler: s.triggers_scheduler,
            triggers_purchase_order: s.triggers_purchase_order,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkTypeResponse {
    pub id: Uuid,
    pub name: String,
    pub color: String,
    pub is_default: bool,
    pub is_active: bool,
    pub stages: Vec<StageResponse>,
}

impl WorkTypeResponse {
    fn from_parts(wt: WorkType, stages: Vec<WorkTypeStage>) -> Self {
        WorkTypeResponse {
            id: wt.id,
            name: wt.name,
            color: wt.color,
            is_default: wt.is_default,
            is_active: wt.is_active,
            stages: stages.into_iter().map(StageResponse::from).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStageRequest {
    pub name: String,
    pub stage_key: Option<String>,
    pub category: String,
    #[serde(default)]
    pub triggers_scheduler: bool,
    #[serde(default)]
    pub triggers_purchase_order: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkTypeRequest {
    pub name: String,
    pub color: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub stages: Vec<CreateStageRequest>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkTypeUpdate {
    pub name: Option<String>,
    pub color: Option<String>,
    pub is_default: Option<bool>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageUpdate {
    pub name: Option<String>,
    pub stage_key: Option<String>,
    pub category: Option<String>,
    pub triggers_scheduler: Option<bool>,
    pub triggers_purchase_order: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderRequest {
    pub stage_ids: Vec<Uuid>,
}

fn find_work_type(conn: &mut PgConnection, id: Uuid) -> AppResult<WorkType> {
    work_types::table
        .find(id)
        .first::<WorkType>(conn)
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("work type {} not found", id)))
}

fn stages_of(conn: &mut PgConnection, work_type_id: Uuid) -> AppResult<Vec<WorkTypeStage>> {
    Ok(work_type_stages::table
        .filter(work_type_stages::work_type_id.eq(work_type_id))
        .order(work_type_stages::order_index.asc())
        .load::<WorkTypeStage>(conn)?)
}

fn build_stage(
    work_type_id: Uuid,
    order_index: i32,
    req: CreateStageRequest,
    now: DateTime<Utc>,
) -> AppResult<WorkTypeStage> {
    let category = StageCategory::parse(&req.category)
        .ok_or_else(|| AppError::Validation(format!("unknown stage category '{}'", req.category)))?;
    let stage_key = req
        .stage_key
        .filter(|k| !k.trim().is_empty())
        .unwrap_or_else(|| slug_key(&req.name));
    Ok(WorkTypeStage {
        id: Uuid::new_v4(),
        work_type_id,
        name: req.name,
        stage_key,
        order_index,
        category: category.as_str().to_string(),
        triggers_scheduler: req.triggers_scheduler,
        triggers_purchase_order: req.triggers_purchase_order,
        created_at: now,
    })
}

pub async fn handle_work_type_list(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<WorkTypeResponse>>> {
    let result = blocking(&state.conn, |conn| {
        let types = work_types::table
            .order(work_types::name.asc())
            .load::<WorkType>(conn)?;
        let mut out = Vec::with_capacity(types.len());
        for wt in types {
            let stages = stages_of(conn, wt.id)?;
            out.push(WorkTypeResponse::from_parts(wt, stages));
        }
        Ok(out)
    })
    .await?;
    Ok(Json(result))
}

pub async fn handle_work_type_get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<WorkTypeResponse>> {
    let result = blocking(&state.conn, move |conn| {
        let wt = find_work_type(conn, id)?;
        let stages = stages_of(conn, id)?;
        Ok(WorkTypeResponse::from_parts(wt, stages))
    })
    .await?;
    Ok(Json(result))
}

pub async fn handle_work_type_create(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateWorkTypeRequest>,
) -> AppResult<Json<WorkTypeResponse>> {
    let result = blocking(&state.conn, move |conn| {
        conn.transaction(|conn| {
            let now = Utc::now();
            let wt = WorkType {
                id: Uuid::new_v4(),
                name: payload.name,
                color: payload.color.unwrap_or_else(|| "#6b7280".to_string()),
                is_default: payload.is_default,
                is_active: true,
                created_at: now,
                updated_at: now,
            };
            diesel::insert_into(work_types::table).values(&wt).execute(conn)?;
            let mut stages = Vec::with_capacity(payload.stages.len());
            for (idx, stage_req) in payload.stages.into_iter().enumerate() {
                stages.push(build_stage(wt.id, idx as i32, stage_req, now)?);
            }
            diesel::insert_into(work_type_stages::table)
                .values(&stages)
                .execute(conn)?;
            Ok(WorkTypeResponse::from_parts(wt, stages))
        })
    })
    .await?;
    log::info!("created work type '{}'", result.name);
    Ok(Json(result))
}

pub async fn handle_work_type_patch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<WorkTypeUpdate>,
) -> AppResult<Json<WorkTypeResponse>> {
    let result = blocking(&state.conn, move |conn| {
        conn.transaction(|conn| {
            let mut wt = find_work_type(conn, id)?;
            if let Some(name) = payload.name {
                wt.name = name;
            }
            if let Some(color) = payload.color {
                wt.color = color;
            }
            if let Some(is_default) = payload.is_default {
                wt.is_default = is_default;
            }
            if let Some(is_active) = payload.is_active {
                wt.is_active = is_active;
            }
            wt.updated_at = Utc::now();
            diesel::update(work_types::table.find(id)).set(&wt).execute(conn)?;
            let stages = stages_of(conn, id)?;
            Ok(WorkTypeResponse::from_parts(wt, stages))
        })
    })
    .await?;
    Ok(Json(result))
}

/// Deletion cascades to stages and their progress rows; jobs pointing at the
/// deleted work type keep running with a null work type.
pub async fn handle_work_type_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    blocking(&state.conn, move |conn| {
        let deleted = diesel::delete(work_types::table.find(id)).execute(conn)?;
        if deleted == 0 {
            return Err(AppError::NotFound(format!("work type {} not found", id)));
        }
        Ok(())
    })
    .await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

pub async fn handle_stage_create(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CreateStageRequest>,
) -> AppResult<Json<StageResponse>> {
    let stage = blocking(&state.conn, move |conn| {
        conn.transaction(|conn| {
            find_work_type(conn, id)?;
            let next_index: i32 = work_type_stages::table
                .filter(work_type_stages::work_type_id.eq(id))
                .count()
                .get_result::<i64>(conn)? as i32;
            let stage = build_stage(id, next_index, payload, Utc::now())?;
            diesel::insert_into(work_type_stages::table)
                .values(&stage)
                .execute(conn)?;
            Ok(stage)
        })
    })
    .await?;
    Ok(Json(stage.into()))
}

pub async fn handle_stage_patch(
    State(state): State<Arc<AppState>>,
    Path((work_type_id, stage_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<StageUpdate>,
) -> AppResult<Json<StageResponse>> {
    let stage = blocking(&state.conn, move |conn| {
        conn.transaction(|conn| {
            let mut stage = work_type_stages::table
                .find(stage_id)
                .filter(work_type_stages::work_type_id.eq(work_type_id))
                .first::<WorkTypeStage>(conn)
                .optional()?
                .ok_or_else(|| AppError::NotFound(format!("stage {} not found", stage_id)))?;
            if let Some(name) = payload.name {
                stage.name = name;
            }
            if let Some(key) = payload.stage_key {
                stage.stage_key = key;
            }
            if let Some(category) = payload.category {
                let parsed = StageCategory::parse(&category).ok_or_else(|| {
                    AppError::Validation(format!("unknown stage category '{}'", category))
                })?;
                stage.category = parsed.as_str().to_string();
            }
            if let Some(v) = payload.triggers_scheduler {
                stage.triggers_scheduler = v;
            }
            if let Some(v) = payload.triggers_purchase_order {
                stage.triggers_purchase_order = v;
            }
            diesel::update(work_type_stages::table.find(stage_id))
                .set(&stage)
                .execute(conn)?;
            Ok(stage)
        })
    })
    .await?;
    Ok(Json(stage.into()))
}

pub async fn handle_stage_delete(
    State(state): State<Arc<AppState>>,
    Path((work_type_id, stage_id)): Path<(Uuid, Uuid)>,
) -> AppResult<Json<serde_json::Value>> {
    blocking(&state.conn, move |conn| {
        let deleted = diesel::delete(
            work_type_stages::table
                .find(stage_id)
                .filter(work_type_stages::work_type_id.eq(work_type_id)),
        )
        .execute(conn)?;
        if deleted == 0 {
            return Err(AppError::NotFound(format!("stage {} not found", stage_id)));
        }
        Ok(())
    })
    .await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

pub async fn handle_stages_reorder(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReorderRequest>,
) -> AppResult<Json<Vec<StageResponse>>> {
    let stages = blocking(&state.conn, move |conn| {
        conn.transaction(|conn| {
            find_work_type(conn, id)?;
            let existing: Vec<Uuid> = work_type_stages::table
                .filter(work_type_stages::work_type_id.eq(id))
                .select(work_type_stages::id)
                .load(conn)?;
            let assignments = reorder_indices(&existing, &payload.stage_ids)?;
            for (stage_id, order_index) in assignments {
                diesel::update(work_type_stages::table.find(stage_id))
                    .set(work_type_stages::order_index.eq(order_index))
                    .execute(conn)?;
            }
            stages_of(conn, id)
        })
    })
    .await?;
    Ok(Json(stages.into_iter().map(StageResponse::from).collect()))
}

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/work-types",
            get(handle_work_type_list).post(handle_work_type_create),
        )
        .route(
            "/api/work-types/:id",
            get(handle_work_type_get)
                .patch(handle_work_type_patch)
                .delete(handle_work_type_delete),
        )
        .route("/api/work-types/:id/stages", post(handle_stage_create))
        .route(
            "/api/work-types/:id/stages/reorder",
            post(handle_stages_reorder),
        )
        .route(
            "/api/work-types/:id/stages/:stage_id",
            axum::routing::patch(handle_stage_patch).delete(handle_stage_delete),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_key_normalizes_names() {
        assert_eq!(slug_key("Order PVC Panels"), "order_pvc_panels");
        assert_eq!(slug_key("  Measure & Quote!  "), "measure_quote");
        assert_eq!(slug_key("already_keyed"), "already_keyed");
    }

    #[test]
    fn reorder_produces_contiguous_indices_for_any_permutation() {
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        let mut permuted = ids.clone();
        permuted.rotate_left(2);
        permuted.swap(0, 3);

        let assignments = reorder_indices(&ids, &permuted).unwrap();
        let indices: Vec<i32> = assignments.iter().map(|(_, idx)| *idx).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        for (pos, (id, _)) in assignments.iter().enumerate() {
            assert_eq!(*id, permuted[pos]);
        }
    }

    #[test]
    fn reorder_rejects_wrong_id_sets() {
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();

        // Missing one id.
        let err = reorder_indices(&ids, &ids[..2]).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        // Foreign id swapped in.
        let mut foreign = ids.clone();
        foreign[1] = Uuid::new_v4();
        let err = reorder_indices(&ids, &foreign).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        // Duplicate id, same length.
        let mut dup = ids.clone();
        dup[2] = dup[0];
        let err = reorder_indices(&ids, &dup).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
