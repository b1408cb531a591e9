#[cfg(test)]
mod integration_tests {
    use crate::test_support::{CaptureCall, FailAt, StubEngine};
    use crate::{
        build_router, AppState, CaptureError, CaptureLedger, CaptureParams, CapturePipeline, Claims, Config,
        Identity, ImageFormat, JwtIdentityVerifier, Viewport,
    };
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use http_body_util::BodyExt;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    const SECRET: &str = "integration-secret-7d41c0e9a2b85f36";

    fn pipeline(engine: &StubEngine, max_concurrent: usize, max_queued: usize) -> Arc<CapturePipeline> {
        let mut config = Config::default();
        config.governor.max_concurrent_captures = max_concurrent;
        config.governor.max_queued_captures = max_queued;
        Arc::new(CapturePipeline::new(config, Arc::new(engine.clone()), CaptureLedger::in_memory()))
    }

    fn token_for(sub: &str) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp: (chrono::Utc::now().timestamp() + 600) as usize,
            username: None,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_lossless_capture_scenario_over_http() {
        let engine = StubEngine::new();
        let pipeline = pipeline(&engine, 2, 4);
        let verifier = JwtIdentityVerifier::new(SECRET).unwrap();
        let app = build_router(AppState::new(pipeline, Arc::new(verifier)), true);
        let token = token_for("identity-a");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/captures")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"url":"http://example.test","width":800,"height":600,"format":"raster-lossless","fullPage":false}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");

        let rendered = engine.last_render().unwrap();
        assert_eq!(rendered.url.as_str(), "http://example.test/");
        assert_eq!(rendered.viewport, Viewport { width: 800, height: 600 });
        assert_eq!(
            engine.last_capture(),
            Some(CaptureCall {
                format: ImageFormat::Png,
                full_page: false,
                quality: None,
            })
        );

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/profile")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(json(response).await["captureCount"], 1);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/captures")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = json(response).await;
        let captures = body["captures"].as_array().unwrap();
        assert_eq!(captures.len(), 1);
        assert_eq!(captures[0]["width"], 800);
        assert_eq!(captures[0]["height"], 600);
        assert_eq!(captures[0]["format"], "png");
        assert_eq!(captures[0]["fullPage"], false);
        assert_eq!(captures[0]["owner"], "identity-a");
    }

    #[tokio::test]
    async fn test_unsupported_scheme_touches_nothing() {
        let engine = StubEngine::new();
        let pipeline = pipeline(&engine, 2, 4);
        let identity = Identity::new("identity-a");

        let err = pipeline
            .capture(&CaptureParams::for_url("ftp://bad"), &identity)
            .await
            .unwrap_err();

        assert!(matches!(err, CaptureError::InvalidRequest(_)));
        assert_eq!(engine.launches(), 0);
        assert!(engine.last_render().is_none());
        assert_eq!(pipeline.tracker().launched(), 0);
        assert_eq!(pipeline.ledger().count_for("identity-a").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_launch_is_released() {
        let engines = vec![
            StubEngine::new(),
            StubEngine::new().failing_at(FailAt::Launch, CaptureError::EngineUnavailable("spawn".into())),
            StubEngine::new().failing_at(FailAt::Render, CaptureError::InvalidTarget("refused".into())),
            StubEngine::new().failing_at(FailAt::Capture, CaptureError::CaptureFailed("blank".into())),
            StubEngine::new().with_delay(FailAt::Render, Duration::from_secs(120)),
            StubEngine::new().with_delay(FailAt::Capture, Duration::from_secs(120)),
            StubEngine::new().with_delay(FailAt::Launch, Duration::from_secs(120)),
        ];
        let identity = Identity::new("identity-a");

        for engine in &engines {
            let pipeline = pipeline(engine, 1, 0);
            for _ in 0..2 {
                let _ = pipeline
                    .capture(&CaptureParams::for_url("https://example.com"), &identity)
                    .await;
            }
            assert_eq!(engine.launches(), engine.releases());
            assert_eq!(pipeline.tracker().launched(), pipeline.tracker().released());
            assert_eq!(pipeline.tracker().live(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_capture_still_releases_engine() {
        let engine = StubEngine::new().with_delay(FailAt::Render, Duration::from_secs(20));
        let pipeline = pipeline(&engine, 1, 0);

        let task = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                pipeline
                    .capture(&CaptureParams::for_url("https://example.com"), &Identity::new("identity-a"))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(engine.launches(), 1);
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.releases(), 1);
        assert_eq!(pipeline.tracker().live(), 0);
        assert_eq!(pipeline.governor().stats().in_flight, 0);
        assert_eq!(pipeline.ledger().count_for("identity-a").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extra_capture_is_queued_then_served() {
        let engine = StubEngine::new().with_delay(FailAt::Render, Duration::from_secs(2));
        let pipeline = pipeline(&engine, 2, 1);

        let mut tasks = Vec::new();
        for i in 0..3 {
            let pipeline = pipeline.clone();
            tasks.push(tokio::spawn(async move {
                pipeline
                    .capture(
                        &CaptureParams::for_url(format!("https://example.com/{i}")),
                        &Identity::new("identity-a"),
                    )
                    .await
            }));
        }

        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        assert_eq!(engine.launches(), 3);
        assert_eq!(engine.max_live(), 2);
        assert_eq!(pipeline.ledger().count_for("identity-a").await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extra_capture_without_queue_is_rejected() {
        let engine = StubEngine::new().with_delay(FailAt::Render, Duration::from_secs(2));
        let pipeline = pipeline(&engine, 2, 0);

        let mut tasks = Vec::new();
        for i in 0..3 {
            let pipeline = pipeline.clone();
            tasks.push(tokio::spawn(async move {
                pipeline
                    .capture(
                        &CaptureParams::for_url(format!("https://example.com/{i}")),
                        &Identity::new("identity-a"),
                    )
                    .await
            }));
        }

        let mut rejected = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => {}
                Err(CaptureError::CapacityExceeded(_)) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(rejected, 1);
        assert_eq!(engine.max_live(), 2);
        assert_eq!(engine.launches(), 2);
    }

    #[tokio::test]
    async fn test_history_pages_compose() {
        let engine = StubEngine::new();
        let pipeline = pipeline(&engine, 2, 4);
        let identity = Identity::new("identity-a");

        for i in 0..5 {
            pipeline
                .capture(&CaptureParams::for_url(format!("https://example.com/{i}")), &identity)
                .await
                .unwrap();
        }

        let ledger = pipeline.ledger();
        let mut paged = ledger.history("identity-a", 2, 0).await.unwrap().records;
        paged.extend(ledger.history("identity-a", 2, 2).await.unwrap().records);
        let whole = ledger.history("identity-a", 4, 0).await.unwrap().records;

        assert_eq!(paged, whole);
        assert_eq!(whole[0].url, "https://example.com/4");
        assert_eq!(ledger.count_for("identity-a").await.unwrap(), 5);
    }
}
