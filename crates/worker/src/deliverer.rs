use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error};

use cronflow_domain::entities::HttpRequestInfo;
use cronflow_domain::ports::Deliverer;
use cronflow_errors::{SchedulerError, SchedulerResult};

/// 基于reqwest的HTTP投递器
pub struct HttpDeliverer {
    client: reqwest::Client,
}

impl HttpDeliverer {
    /// 创建投递器，`timeout` 约束整个请求的耗时
    pub fn new(timeout: Duration) -> SchedulerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SchedulerError::Delivery(format!("构建HTTP客户端失败: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Deliverer for HttpDeliverer {
    async fn deliver(&self, request: &HttpRequestInfo) -> SchedulerResult<()> {
        let builder = match request.method.to_uppercase().as_str() {
            "GET" => self.client.get(&request.url),
            "POST" => self.client.post(&request.url),
            "PUT" => self.client.put(&request.url),
            "DELETE" => self.client.delete(&request.url),
            "PATCH" => self.client.patch(&request.url),
            "HEAD" => self.client.head(&request.url),
            other => {
                return Err(SchedulerError::Delivery(format!(
                    "不支持的HTTP方法: {other}"
                )));
            }
        };

        let mut builder = builder;
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| SchedulerError::Delivery(format!("HTTP请求失败: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            error!("投递目标返回非成功状态: {} {}", status, request.url);
            return Err(SchedulerError::Delivery(format!(
                "HTTP状态码 {status}: {}",
                request.url
            )));
        }

        debug!("投递成功: {} {}", request.method, request.url);
        Ok(())
    }
}
