//! 执行管理处理器
//! 启动、查询与恢复波次执行

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    error::{AppError, Result},
    extract::{optional_body, Payload},
    middleware::AppState,
    models::{
        audit::AuditRecord,
        execution::{CreateExecutionRequest, Execution, ExecutionResult, ExecutionStatus},
    },
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionAccepted {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub waves: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionView {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub result: Option<ExecutionResult>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRequest {
    /// 缺省使用挂起时记录的检查点
    pub from_wave: Option<usize>,
}

/// 启动执行（后台运行）
pub async fn create_execution(
    State(state): State<Arc<AppState>>,
    Payload(req): Payload<CreateExecutionRequest>,
) -> Result<impl IntoResponse> {
    let execution = req.into_execution()?;
    state.scheduler.admit(&execution)?;

    let accepted = ExecutionAccepted {
        execution_id: execution.id.clone(),
        status: ExecutionStatus::Running { wave: 0 },
        waves: execution.waves.len(),
    };
    spawn_run(state, execution, 0);

    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

/// 查询执行状态
pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionView>> {
    let status = state
        .scheduler
        .status(&id)
        .ok_or_else(|| AppError::NotFound(format!("execution {}", id)))?;

    Ok(Json(ExecutionView {
        result: state.scheduler.result(&id),
        execution_id: id,
        status,
    }))
}

/// 从检查点恢复挂起的执行
pub async fn resume_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let body: Option<ResumeRequest> = optional_body(&body)?;
    let execution = state
        .scheduler
        .execution(&id)
        .ok_or_else(|| AppError::NotFound(format!("execution {}", id)))?;

    let checkpoint = match state.scheduler.status(&id) {
        Some(ExecutionStatus::Suspended { resume_from_wave }) => resume_from_wave,
        _ => {
            return Err(AppError::BadRequest(format!(
                "execution {} is not suspended",
                id
            )))
        }
    };
    let from_wave = body.and_then(|b| b.from_wave).unwrap_or(checkpoint);
    if from_wave >= execution.waves.len() {
        return Err(AppError::Validation(format!(
            "fromWave {} is out of range",
            from_wave
        )));
    }

    state.scheduler.admit(&execution)?;
    let accepted = ExecutionAccepted {
        execution_id: id,
        status: ExecutionStatus::Running { wave: from_wave },
        waves: execution.waves.len(),
    };
    spawn_run(state, execution, from_wave);

    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

/// 执行的审计记录
pub async fn get_execution_audit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<AuditRecord>>> {
    Ok(Json(state.audit.history(&id).await?))
}

fn spawn_run(state: Arc<AppState>, execution: Execution, from_wave: usize) {
    tokio::spawn(async move {
        let outcome = if from_wave == 0 {
            Ok(state.scheduler.run(&execution).await)
        } else {
            state.scheduler.resume(&execution, from_wave).await
        };
        if let Err(e) = outcome {
            tracing::error!(execution_id = %execution.id, error = %e, "Execution could not start");
        }
    });
}
