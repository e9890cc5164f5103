/// `message` is the historical field name; `prompt` is accepted too.
#[derive(Debug, Deserialize)]
struct ChatHttpRequest {
    #[serde(default, alias = "prompt")]
    message: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

/// Decodes the body, returning the rejection reason on failure. Validation of
/// the message itself happens in the pipeline, after admission.
fn parse_chat_body(body: &[u8]) -> Result<ChatHttpRequest, String> {
    serde_json::from_slice(body).map_err(|err| format!("invalid json body: {err}"))
}

async fn handle_chat(
    State(state): State<GatewayHttpState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = extract_header(&headers, "x-request-id").unwrap_or_else(generate_request_id);
    let mut response_headers = HeaderMap::new();
    insert_header(&mut response_headers, REQUEST_ID_HEADER, &request_id);

    let (prompt, model, body_error) = match parse_chat_body(&body) {
        Ok(payload) => (payload.message.unwrap_or_default(), payload.model, None),
        Err(reason) => {
            tracing::debug!(request_id = %request_id, error = %reason, "undecodable chat body");
            (String::new(), None, Some(reason))
        }
    };

    let request = ChatRequest {
        client_ip: client_ip(&headers, connect_info.map(|ConnectInfo(addr)| addr)),
        credential: extract_bearer(&headers),
        prompt,
        model,
        request_id,
        body_error,
    };

    match state.gateway.handle(request).await {
        Ok(response) => {
            response_headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            insert_header(
                &mut response_headers,
                CACHE_HEADER,
                response.tier.header_value(),
            );
            (StatusCode::OK, response_headers, response.body).into_response()
        }
        Err(err) => (response_headers, map_gateway_error(&err)).into_response(),
    }
}

async fn handle_checkout(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<ErrorResponse>)> {
    let credential = extract_bearer(&headers);
    state
        .gateway
        .authenticate(credential.as_deref())
        .await
        .map_err(|err| map_gateway_error(&err))?;
    // authenticate rejects a missing credential, so this is always present.
    let credential = credential.unwrap_or_default();

    let Some(handler) = state.checkout.as_ref() else {
        return Err(error_response(
            StatusCode::NOT_IMPLEMENTED,
            "not_configured",
            "checkout is not configured",
        ));
    };

    let payload = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).map_err(|err| {
            error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                format!("invalid json body: {err}"),
            )
        })?
    };

    handler
        .checkout(&credential, payload)
        .await
        .map(Json)
        .map_err(|err| {
            tracing::warn!(
                credential = %redact_credential(&credential),
                operation = "checkout",
                error = %err,
                "checkout failed"
            );
            error_response(StatusCode::BAD_GATEWAY, "checkout_failed", err.to_string())
        })
}
