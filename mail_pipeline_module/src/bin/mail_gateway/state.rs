use mail_pipeline_module::EmailPipeline;

#[derive(Clone)]
pub(super) struct GatewayState {
    pub(super) pipeline: EmailPipeline,
}
