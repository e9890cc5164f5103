#[derive(Debug, Serialize)]
struct UpgradeResponse {
    upgraded: bool,
    usage_count: i64,
    usage_limit: i64,
}

fn ensure_admin(
    state: &GatewayHttpState,
    headers: &HeaderMap,
) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "not_configured",
            "admin auth not configured",
        ));
    };

    let provided = extract_header(headers, ADMIN_TOKEN_HEADER)
        .or_else(|| extract_bearer(headers))
        .unwrap_or_default();
    if provided == expected {
        return Ok(());
    }

    Err(error_response(
        StatusCode::UNAUTHORIZED,
        "unauthorized",
        "invalid admin token",
    ))
}

async fn upgrade_credential(
    State(state): State<GatewayHttpState>,
    Path(credential): Path<String>,
    headers: HeaderMap,
) -> Result<Json<UpgradeResponse>, (StatusCode, Json<ErrorResponse>)> {
    ensure_admin(&state, &headers)?;

    let upgraded = state
        .gateway
        .upgrade(&credential, state.upgrade_limit)
        .await
        .map_err(|err| {
            tracing::warn!(
                credential = %redact_credential(&credential),
                operation = "quota.upgrade",
                error = %err,
                "upgrade failed"
            );
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "quota_unavailable",
                err.to_string(),
            )
        })?;

    if !upgraded {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            "unknown credential",
        ));
    }

    Ok(Json(UpgradeResponse {
        upgraded,
        usage_count: 0,
        usage_limit: state.upgrade_limit,
    }))
}
