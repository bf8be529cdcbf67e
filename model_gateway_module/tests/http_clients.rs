use std::time::Duration;

use mockito::{Matcher, Server};
use model_gateway_module::{
    AzureOpenAiClient, AzureOpenAiConfig, CompletionRequest, DocumentExtractor, DocumentInput,
    DocumentServiceClient, DocumentServiceConfig, Embedder, Generator, ModelGatewayError,
};

fn azure_config(endpoint: String) -> AzureOpenAiConfig {
    AzureOpenAiConfig {
        endpoint,
        api_key: "test-key".to_string(),
        api_version: "2024-06-01".to_string(),
        chat_deployment: "chat".to_string(),
        embedding_deployment: "embed".to_string(),
        timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn completion_returns_first_choice() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/openai/deployments/chat/chat/completions")
        .match_query(Matcher::UrlEncoded(
            "api-version".into(),
            "2024-06-01".into(),
        ))
        .match_header("api-key", "test-key")
        .match_body(Matcher::PartialJson(serde_json::json!({ "max_tokens": 256 })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"Hi there"}}]}"#)
        .create_async()
        .await;

    let client = AzureOpenAiClient::new(azure_config(server.url()))?;
    let text = client
        .complete(&CompletionRequest {
            system: Some("be brief".to_string()),
            prompt: "hello".to_string(),
            max_output_tokens: 256,
        })
        .await?;

    assert_eq!(text, "Hi there");
    mock.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn completion_surfaces_error_status() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/openai/deployments/chat/chat/completions")
        .match_query(Matcher::Any)
        .with_status(429)
        .with_body("rate limited")
        .create_async()
        .await;

    let client = AzureOpenAiClient::new(azure_config(server.url()))?;
    let err = client
        .complete(&CompletionRequest {
            system: None,
            prompt: "hello".to_string(),
            max_output_tokens: 16,
        })
        .await
        .unwrap_err();

    match err {
        ModelGatewayError::Status { status, body } => {
            assert_eq!(status, 429);
            assert_eq!(body, "rate limited");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn embedding_parses_vector() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/openai/deployments/embed/embeddings")
        .match_query(Matcher::Any)
        .match_body(Matcher::PartialJson(serde_json::json!({ "input": "quarterly report" })))
        .with_status(200)
        .with_body(r#"{"data":[{"embedding":[0.5,-0.25,1.0]}]}"#)
        .create_async()
        .await;

    let client = AzureOpenAiClient::new(azure_config(server.url()))?;
    let vector = client.embed("quarterly report").await?;
    assert_eq!(vector, vec![0.5, -0.25, 1.0]);
    Ok(())
}

#[tokio::test]
async fn embedding_rejects_empty_data() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/openai/deployments/embed/embeddings")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"data":[]}"#)
        .create_async()
        .await;

    let client = AzureOpenAiClient::new(azure_config(server.url()))?;
    let err = client.embed("anything").await.unwrap_err();
    assert!(matches!(err, ModelGatewayError::InvalidResponse(_)));
    Ok(())
}

#[tokio::test]
async fn document_service_sends_base64_payload() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/extract")
        .match_header("authorization", "Bearer doc-key")
        .match_body(Matcher::PartialJson(serde_json::json!({
            "file_name": "notes.txt",
            "content_type": "text/plain",
            "content": "aGVsbG8=",
        })))
        .with_status(200)
        .with_body(r#"{"text":"hello"}"#)
        .create_async()
        .await;

    let client = DocumentServiceClient::new(DocumentServiceConfig {
        base_url: server.url(),
        api_key: Some("doc-key".to_string()),
        timeout: Duration::from_secs(5),
    })?;
    let text = client
        .extract_text(DocumentInput {
            file_name: "notes.txt",
            content_type: "text/plain",
            content: b"hello",
        })
        .await?;

    assert_eq!(text, "hello");
    mock.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn document_service_reports_provider_error() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/extract")
        .with_status(200)
        .with_body(r#"{"error":"unsupported format"}"#)
        .create_async()
        .await;

    let client = DocumentServiceClient::new(DocumentServiceConfig {
        base_url: server.url(),
        api_key: None,
        timeout: Duration::from_secs(5),
    })?;
    let err = client
        .extract_text(DocumentInput {
            file_name: "scan.tiff",
            content_type: "image/tiff",
            content: &[1, 2, 3],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ModelGatewayError::InvalidResponse(_)));
    Ok(())
}
