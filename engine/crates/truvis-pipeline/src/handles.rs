use slotmap::new_key_type;

new_key_type! {
    /// `PipelineHub` 中的工厂
    pub struct PipelineFactoryHandle;

    /// 调用者的结果槽，生命周期长于写入它的工厂
    pub struct PipelineSlotHandle;
}
